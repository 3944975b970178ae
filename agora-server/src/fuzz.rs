#![cfg(test)]

use std::{cmp, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe, path::Path, sync::Arc};

use agora_api::{
    Comment, ConfirmedId, Error as ApiError, MessageStore, NewComment, ResourceId, UserId,
};
use agora_mock_server::MockStore;
use bolero::generator::TypeGenerator;
use axum::{
    http::{self, request},
    Router,
};
use chrono::{Duration, TimeZone, Utc};
use sqlx::PgPool;
use tower::{Service, ServiceExt};

use crate::{db::PgStore, *};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

fn build_pg_cluster(data: &Path) -> postgresfixture::cluster::Cluster {
    let mut runtime = None;
    let mut best_version = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            match (&mut runtime, &mut best_version) {
                (None, None) => {
                    runtime = Some(r);
                    best_version = Some(v);
                }
                (Some(runtime), Some(best_version)) => {
                    if *best_version < v {
                        *runtime = r;
                        *best_version = v;
                    }
                }
                _ => unreachable!(),
            }
        }
    }
    postgresfixture::cluster::Cluster::new(
        data,
        runtime.expect("postgresql seems to not be installed in path"),
    )
}

/// Runs `$fn` against a throwaway postgres cluster, emptied between two inputs
macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                tracing_subscriber::fmt::init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &Path = datadir.as_ref();
            let cluster = build_pg_cluster(datadir_path);
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                let pool = AssertUnwindSafe(runtime.block_on(async move {
                    let pool = create_sqlx_pool(&format!(
                        "postgresql://?host={}&dbname=test_db",
                        datadir_path
                    ))
                    .await
                    .expect("creating sqlx pool");
                    MIGRATOR
                        .run(&mut *pool.acquire().await.expect("getting migrator connection"))
                        .await
                        .expect("failed applying migrations");
                    pool
                }));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool: PgPool = pool.clone();
                        let res = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool, v).await;
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        if let Err(e) = res {
                            std::panic::resume_unwind(e);
                        }
                    });
            })
            .expect("coordinating spinup and shutdown of the pg cluster");
        }
    };
}

async fn call<Resp>(app: &mut Router, req: request::Request<axum::body::Body>) -> Result<Resp, ApiError>
where
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    if status == http::StatusCode::OK {
        if std::any::TypeId::of::<Resp>() == std::any::TypeId::of::<()>() {
            // the server returns an empty body in this situation, which does not parse as json
            return Ok(serde_json::from_slice(b"null").unwrap());
        }
        return Ok(serde_json::from_slice(&body)
            .unwrap_or_else(|err| panic!("failed parsing resp body {body:?}: {err}")));
    }
    Err(ApiError::parse(&body)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {body:?}")))
}

async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    body: Option<&Req>,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    let body = match body {
        Some(body) => axum::body::Body::from(
            serde_json::to_vec(body).expect("serializing request body to json"),
        ),
        None => axum::body::Body::empty(),
    };
    call(app, req.body(body).expect("building request")).await
}

/// What the store itself reports, as a client of the http api would see it
fn through_api<T>(res: anyhow::Result<T>) -> Result<T, ApiError> {
    res.map_err(|err| match err.downcast::<ApiError>() {
        Ok(err) => err,
        Err(err) => ApiError::Unknown(format!("{err:#}")),
    })
}

fn compare<T>(name: &str, app_res: Result<T, ApiError>, mock_res: Result<T, ApiError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res, mock_res,
        "app and mock did not return the same result for {name}"
    );
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    Insert {
        resource: bool,
        parent: Option<usize>,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        content: String,
        secs: u16,
    },
    /// Reply to a comment that does not exist
    InsertOrphan { parent: i64 },
    List { resource: bool },
    Children { id: usize },
    Delete { ids: Vec<usize> },
}

struct ComparativeFuzzer {
    app: Router,
    mock: MockStore,
    known: Vec<ConfirmedId>,
}

impl ComparativeFuzzer {
    fn new(pool: PgPool) -> ComparativeFuzzer {
        ComparativeFuzzer {
            app: app(Arc::new(PgStore::new(pool))),
            mock: MockStore::new(),
            known: Vec::new(),
        }
    }

    fn pick(&self, id: usize) -> Option<ConfirmedId> {
        resize_int(id, ..self.known.len()).map(|i| self.known[i])
    }

    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::Insert {
                resource,
                parent,
                content,
                secs,
            } => {
                let comment = NewComment {
                    author_id: UserId::stub(),
                    resource_id: ResourceId(i64::from(resource)),
                    content,
                    parent_id: parent.and_then(|p| self.pick(p)),
                    created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap()
                        + Duration::seconds(i64::from(secs)),
                };
                let app_res =
                    run_on_app(&mut self.app, "POST", "/api/comments", Some(&comment)).await;
                let mock_res = through_api(self.mock.insert(comment).await);
                if let Ok(id) = &mock_res {
                    self.known.push(*id);
                }
                compare("Insert", app_res, mock_res)
            }
            FuzzOp::InsertOrphan { parent } => {
                let parent = ConfirmedId(parent.saturating_add(1_000_000).abs());
                let comment =
                    NewComment::now(UserId::stub(), ResourceId(0), String::from("x"), Some(parent));
                compare(
                    "InsertOrphan",
                    run_on_app(&mut self.app, "POST", "/api/comments", Some(&comment)).await,
                    through_api::<ConfirmedId>(self.mock.insert(comment).await),
                )
            }
            FuzzOp::List { resource } => {
                let resource = ResourceId(i64::from(resource));
                compare(
                    "List",
                    run_on_app::<(), Vec<Comment>>(
                        &mut self.app,
                        "GET",
                        &format!("/api/resources/{}/comments", resource.0),
                        None,
                    )
                    .await,
                    through_api(self.mock.list_for_resource(resource).await),
                )
            }
            FuzzOp::Children { id } => {
                if let Some(id) = self.pick(id) {
                    compare(
                        "Children",
                        run_on_app::<(), Vec<ConfirmedId>>(
                            &mut self.app,
                            "GET",
                            &format!("/api/comments/{}/children", id.0),
                            None,
                        )
                        .await,
                        through_api(self.mock.list_children(id).await),
                    )
                }
            }
            FuzzOp::Delete { ids } => {
                let ids = ids
                    .into_iter()
                    .filter_map(|i| self.pick(i))
                    .collect::<Vec<_>>();
                let app_res =
                    run_on_app(&mut self.app, "POST", "/api/comments/delete", Some(&ids)).await;
                let mock_res = match ids.is_empty() {
                    true => Ok(()),
                    false => through_api(self.mock.delete_many(&ids).await),
                };
                let deleted = mock_res.is_ok();
                compare("Delete", app_res, mock_res);
                if deleted {
                    self.known.retain(|id| !ids.contains(id));
                }
            }
        }
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool);
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);

do_sqlx_test!(
    store_integrity_matches_mock,
    bolero::generator::gen::<u16>(),
    |pool, secs: u16| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool);
        let insert = |resource, parent| FuzzOp::Insert {
            resource,
            parent,
            content: String::from("hi"),
            secs,
        };
        fuzzer.execute_fuzz_op(insert(false, None)).await;
        fuzzer.execute_fuzz_op(insert(false, Some(0))).await;
        assert_eq!(fuzzer.known, vec![ConfirmedId(1), ConfirmedId(2)]);

        // a reply to a comment of another resource
        let reply = NewComment::now(
            UserId::stub(),
            ResourceId(1),
            String::from("elsewhere"),
            Some(ConfirmedId(1)),
        );
        assert_eq!(
            run_on_app::<_, ConfirmedId>(&mut fuzzer.app, "POST", "/api/comments", Some(&reply))
                .await,
            Err(ApiError::UnknownParent(ConfirmedId(1)))
        );
        fuzzer.execute_fuzz_op(insert(true, Some(0))).await;

        // deleting a parent without its reply
        assert_eq!(
            run_on_app::<_, ()>(
                &mut fuzzer.app,
                "POST",
                "/api/comments/delete",
                Some(&vec![ConfirmedId(1)])
            )
            .await,
            Err(ApiError::HasReplies(ConfirmedId(1)))
        );
        fuzzer
            .execute_fuzz_op(FuzzOp::Delete { ids: vec![0] })
            .await;
        fuzzer
            .execute_fuzz_op(FuzzOp::List { resource: false })
            .await;
        fuzzer
            .execute_fuzz_op(FuzzOp::Delete {
                ids: vec![0, usize::MAX],
            })
            .await;
        fuzzer
            .execute_fuzz_op(FuzzOp::List { resource: false })
            .await;
        assert!(fuzzer.known.is_empty());
    }
);

do_tokio_test!(fuzz_room_names, String, |name: String| async move {
    let mut app = app(Arc::new(MockStore::new()));
    let uri = format!("/ws/room/{name}");
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri(&uri)
        .body(axum::body::Body::empty())
    {
        app.ready().await.expect("waiting for app to be ready");
        let resp = app.call(req).await.expect("running request");
        // not a websocket upgrade, so nothing may succeed
        assert!(!resp.status().is_success(), "{uri:?} was accepted");
    }
});

#[tokio::test]
async fn comments_round_trip() {
    let mut app = app(Arc::new(MockStore::with_next_id(42)));
    let first = NewComment::now(UserId::stub(), ResourceId(3), String::from("hello"), None);
    let id: ConfirmedId = run_on_app(&mut app, "POST", "/api/comments", Some(&first))
        .await
        .unwrap();
    assert_eq!(id, ConfirmedId(42));
    let reply = NewComment::now(UserId::stub(), ResourceId(3), String::from("hi"), Some(id));
    let reply_id: ConfirmedId = run_on_app(&mut app, "POST", "/api/comments", Some(&reply))
        .await
        .unwrap();

    let history: Vec<Comment> =
        run_on_app::<(), _>(&mut app, "GET", "/api/resources/3/comments", None)
            .await
            .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "hello");
    assert_eq!(history[1].parent_id, Some(id.into()));

    let children: Vec<ConfirmedId> =
        run_on_app::<(), _>(&mut app, "GET", "/api/comments/42/children", None)
            .await
            .unwrap();
    assert_eq!(children, vec![reply_id]);

    let () = run_on_app(&mut app, "POST", "/api/comments/delete", Some(&vec![id, reply_id]))
        .await
        .unwrap();
    let history: Vec<Comment> =
        run_on_app::<(), _>(&mut app, "GET", "/api/resources/3/comments", None)
            .await
            .unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn invalid_comments_are_rejected() {
    let mut app = app(Arc::new(MockStore::new()));
    let empty = NewComment::now(UserId::stub(), ResourceId(1), String::from(" "), None);
    assert_eq!(
        run_on_app::<_, ConfirmedId>(&mut app, "POST", "/api/comments", Some(&empty)).await,
        Err(ApiError::EmptyContent)
    );
    let orphan = NewComment::now(
        UserId::stub(),
        ResourceId(1),
        String::from("hey"),
        Some(ConfirmedId(7)),
    );
    assert_eq!(
        run_on_app::<_, ConfirmedId>(&mut app, "POST", "/api/comments", Some(&orphan)).await,
        Err(ApiError::UnknownParent(ConfirmedId(7)))
    );
}
