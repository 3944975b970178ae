use std::collections::{HashMap, HashSet, VecDeque};

use crate::api::{Comment, CommentId};

/// Nesting level at which a thread is being built
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Depth {
    Top,
    Reply,
}

impl Depth {
    pub fn level(&self) -> u8 {
        match self {
            Depth::Top => 0,
            Depth::Reply => 1,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadedComment {
    pub comment: Comment,

    /// Only set on top-level entries: replies never carry nested replies
    pub replies: Option<Vec<ThreadedComment>>,
}

impl ThreadedComment {
    fn leaf(comment: &Comment) -> ThreadedComment {
        ThreadedComment {
            comment: comment.clone(),
            replies: None,
        }
    }

    pub fn reply_count(&self) -> usize {
        self.replies.as_ref().map_or(0, |r| r.len())
    }
}

/// Turns a chronologically ordered list into a reply tree at most two levels deep
///
/// At [`Depth::Top`], every comment matching `parent` gets the whole of its
/// reply chain as a flat list of replies, in list order. At [`Depth::Reply`],
/// the comments below `parent` are returned as leaves.
///
/// With `parent == None`, the top level also holds the comments whose parent
/// is not in the list, so that nothing goes missing from the tree.
pub fn build_thread(
    comments: &[Comment],
    parent: Option<CommentId>,
    depth: Depth,
) -> Vec<ThreadedComment> {
    let index = Index::new(comments);
    let mut placed = vec![false; comments.len()];

    let roots = match parent {
        None => index.roots(),
        Some(p) => {
            for (i, c) in comments.iter().enumerate() {
                if c.id == p {
                    placed[i] = true;
                }
            }
            match depth {
                Depth::Top => index.children_of(&p).to_vec(),
                Depth::Reply => {
                    return index
                        .descendants(p, &mut placed)
                        .into_iter()
                        .map(|i| ThreadedComment::leaf(&comments[i]))
                        .collect()
                }
            }
        }
    };
    for &r in &roots {
        placed[r] = true;
    }
    if depth == Depth::Reply {
        return roots
            .into_iter()
            .map(|i| ThreadedComment::leaf(&comments[i]))
            .collect();
    }

    let mut res = roots
        .into_iter()
        .map(|i| (i, index.descendants(comments[i].id, &mut placed)))
        .collect::<Vec<_>>();
    if parent.is_none() {
        // reply cycles have no root, promote their earliest member
        for i in 0..comments.len() {
            if !placed[i] {
                placed[i] = true;
                let replies = index.descendants(comments[i].id, &mut placed);
                res.push((i, replies));
            }
        }
        res.sort_by_key(|(i, _)| *i);
    }

    res.into_iter()
        .map(|(i, replies)| ThreadedComment {
            comment: comments[i].clone(),
            replies: Some(
                replies
                    .into_iter()
                    .map(|r| ThreadedComment::leaf(&comments[r]))
                    .collect(),
            ),
        })
        .collect()
}

struct Index<'a> {
    comments: &'a [Comment],
    ids: HashSet<CommentId>,
    children: HashMap<CommentId, Vec<usize>>,
}

impl<'a> Index<'a> {
    fn new(comments: &'a [Comment]) -> Index<'a> {
        let mut children = HashMap::<CommentId, Vec<usize>>::new();
        for (i, c) in comments.iter().enumerate() {
            if let Some(p) = c.parent_id {
                if p != c.id {
                    children.entry(p).or_default().push(i);
                }
            }
        }
        Index {
            comments,
            ids: comments.iter().map(|c| c.id).collect(),
            children,
        }
    }

    fn children_of(&self, id: &CommentId) -> &[usize] {
        self.children.get(id).map_or(&[], |c| c as &[usize])
    }

    fn roots(&self) -> Vec<usize> {
        self.comments
            .iter()
            .enumerate()
            .filter(|(_, c)| match c.parent_id {
                None => true,
                Some(p) => p == c.id || !self.ids.contains(&p),
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Breadth-first walk below `root`, returned in list order
    fn descendants(&self, root: CommentId, placed: &mut [bool]) -> Vec<usize> {
        let mut res = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            for &i in self.children_of(&id) {
                if !placed[i] {
                    placed[i] = true;
                    res.push(i);
                    queue.push_back(self.comments[i].id);
                }
            }
        }
        res.sort_unstable();
        res
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::api::{Author, ConfirmedId, TempId};

    fn id(i: i64) -> CommentId {
        CommentId::Confirmed(ConfirmedId(i))
    }

    fn comment(i: i64, parent: Option<i64>) -> Comment {
        Comment {
            id: id(i),
            content: format!("comment {i}"),
            author: Author {
                name: String::from("bob"),
                avatar_url: None,
            },
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(i),
            parent_id: parent.map(id),
        }
    }

    fn shape(tree: &[ThreadedComment]) -> Vec<(CommentId, Option<Vec<CommentId>>)> {
        tree.iter()
            .map(|t| {
                (
                    t.comment.id,
                    t.replies
                        .as_ref()
                        .map(|r| r.iter().map(|r| r.comment.id).collect()),
                )
            })
            .collect()
    }

    #[test]
    fn chains_are_flattened_to_one_level() {
        let comments = vec![
            comment(1, None),
            comment(2, Some(1)),
            comment(3, Some(2)),
            comment(4, Some(3)),
            comment(5, None),
        ];
        let tree = build_thread(&comments, None, Depth::Top);
        assert_eq!(
            shape(&tree),
            vec![
                (id(1), Some(vec![id(2), id(3), id(4)])),
                (id(5), Some(vec![])),
            ]
        );
        for r in tree[0].replies.as_ref().unwrap() {
            assert_eq!(r.replies, None);
        }
        assert_eq!(tree[0].reply_count(), 3);
    }

    #[test]
    fn replies_keep_list_order() {
        let comments = vec![
            comment(1, None),
            comment(2, Some(1)),
            comment(3, Some(2)),
            comment(4, Some(1)),
        ];
        let tree = build_thread(&comments, None, Depth::Top);
        assert_eq!(shape(&tree), vec![(id(1), Some(vec![id(2), id(3), id(4)]))]);
    }

    #[test]
    fn orphans_are_top_level() {
        let comments = vec![comment(1, None), comment(2, Some(99)), comment(3, Some(2))];
        let tree = build_thread(&comments, None, Depth::Top);
        assert_eq!(
            shape(&tree),
            vec![(id(1), Some(vec![])), (id(2), Some(vec![id(3)]))]
        );
    }

    #[test]
    fn temporary_parents_are_followed() {
        let t = CommentId::Temporary(TempId::generate());
        let mut parent = comment(1, None);
        parent.id = t;
        let mut reply = comment(2, None);
        reply.parent_id = Some(t);
        let tree = build_thread(&[parent, reply], None, Depth::Top);
        assert_eq!(shape(&tree), vec![(t, Some(vec![id(2)]))]);
    }

    #[test]
    fn cycles_do_not_loop_or_vanish() {
        let comments = vec![comment(1, Some(2)), comment(2, Some(1)), comment(3, Some(3))];
        let tree = build_thread(&comments, None, Depth::Top);
        assert_eq!(
            shape(&tree),
            vec![(id(1), Some(vec![id(2)])), (id(3), Some(vec![]))]
        );
    }

    #[test]
    fn below_a_given_parent() {
        let comments = vec![
            comment(1, None),
            comment(2, Some(1)),
            comment(3, Some(2)),
            comment(4, Some(1)),
        ];
        assert_eq!(
            shape(&build_thread(&comments, Some(id(1)), Depth::Top)),
            vec![(id(2), Some(vec![id(3)])), (id(4), Some(vec![]))]
        );
        assert_eq!(
            shape(&build_thread(&comments, Some(id(1)), Depth::Reply)),
            vec![(id(2), None), (id(3), None), (id(4), None)]
        );
        assert_eq!(
            shape(&build_thread(&comments, None, Depth::Reply)),
            vec![(id(1), None)]
        );
        assert!(build_thread(&comments, Some(id(4)), Depth::Top).is_empty());
    }

    #[test]
    fn empty_list() {
        assert!(build_thread(&[], None, Depth::Top).is_empty());
    }

    #[test]
    fn fuzz_thread_shape() {
        bolero::check!()
            .with_type::<Vec<Option<u8>>>()
            .for_each(|parents| {
                let comments = parents
                    .iter()
                    .enumerate()
                    .map(|(i, p)| comment(i as i64, p.map(|p| i64::from(p % 32))))
                    .collect::<Vec<_>>();
                let tree = build_thread(&comments, None, Depth::Top);
                assert_eq!(tree, build_thread(&comments, None, Depth::Top));

                let mut seen = Vec::new();
                for t in &tree {
                    seen.push(t.comment.id);
                    for r in t.replies.as_ref().expect("top level always has replies") {
                        assert_eq!(r.replies, None);
                        seen.push(r.comment.id);
                    }
                }
                seen.sort();
                let mut expected = comments.iter().map(|c| c.id).collect::<Vec<_>>();
                expected.sort();
                assert_eq!(seen, expected);
                assert!(tree
                    .windows(2)
                    .all(|w| w[0].comment.created_at < w[1].comment.created_at));
            });
    }
}
