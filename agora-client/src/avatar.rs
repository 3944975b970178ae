use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::api::Author;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Avatar {
    Url(String),
    /// Shown when the comment carries no usable picture
    Initial(String),
}

/// Uppercased first letter of `name`, or `?` for nameless authors
pub fn fallback_initial(name: &str) -> String {
    match name.trim().chars().next() {
        Some(c) => c.to_uppercase().collect(),
        None => String::from("?"),
    }
}

/// Pictures that recently failed to load, keyed by their url
///
/// A picture is only ever taken from the comment itself: authors are display
/// identities, so nothing is carried over from one comment to another.
///
/// Best-effort and per process: entries expire after `ttl` so that broken
/// pictures get retried, and the oldest entry is evicted once `capacity` is
/// reached. Share one instance between the views of a process rather than
/// building one per view.
pub struct AvatarCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<Entries>,
}

#[derive(Default)]
struct Entries {
    broken: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl AvatarCache {
    pub fn new(capacity: usize, ttl: Duration) -> AvatarCache {
        AvatarCache {
            capacity,
            ttl,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Picture to show for `author`
    pub fn resolve(&self, author: &Author) -> Avatar {
        self.resolve_at(author, Instant::now())
    }

    /// Records that `url` could not be loaded, so that initials get shown instead
    pub fn mark_broken(&self, url: &str) {
        self.mark_broken_at(url, Instant::now())
    }

    pub fn is_broken(&self, url: &str) -> bool {
        self.is_broken_at(url, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().broken.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut e = self.entries.lock();
        e.broken.clear();
        e.order.clear();
    }

    fn resolve_at(&self, author: &Author, now: Instant) -> Avatar {
        match &author.avatar_url {
            Some(url) if !url.is_empty() && !self.is_broken_at(url, now) => {
                Avatar::Url(url.clone())
            }
            _ => Avatar::Initial(fallback_initial(author.display_name())),
        }
    }

    fn mark_broken_at(&self, url: &str, now: Instant) {
        if self.capacity == 0 {
            return;
        }
        let mut e = self.entries.lock();
        if e.broken.insert(String::from(url), now).is_some() {
            e.order.retain(|u| u != url);
        }
        e.order.push_back(String::from(url));
        while e.broken.len() > self.capacity {
            match e.order.pop_front() {
                Some(oldest) => {
                    e.broken.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn is_broken_at(&self, url: &str, now: Instant) -> bool {
        let mut e = self.entries.lock();
        match e.broken.get(url) {
            None => return false,
            Some(at) if now.saturating_duration_since(*at) < self.ttl => return true,
            Some(_) => (),
        }
        e.broken.remove(url);
        e.order.retain(|u| u != url);
        false
    }
}

impl Default for AvatarCache {
    fn default() -> AvatarCache {
        AvatarCache::new(256, Duration::from_secs(60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(name: &str, url: Option<&str>) -> Author {
        Author {
            name: String::from(name),
            avatar_url: url.map(String::from),
        }
    }

    #[test]
    fn initials() {
        assert_eq!(fallback_initial("hugo"), "H");
        assert_eq!(fallback_initial(" élise"), "É");
        assert_eq!(fallback_initial(""), "?");
    }

    #[test]
    fn pictures_come_from_the_comment_only() {
        let cache = AvatarCache::default();
        assert_eq!(
            cache.resolve(&author("hugo", Some("https://example.org/x.png"))),
            Avatar::Url(String::from("https://example.org/x.png"))
        );
        assert_eq!(
            cache.resolve(&author("hugo", None)),
            Avatar::Initial(String::from("H"))
        );
        assert_eq!(
            cache.resolve(&author("hugo", Some(""))),
            Avatar::Initial(String::from("H"))
        );
        assert_eq!(
            cache.resolve(&author("", None)),
            Avatar::Initial(String::from("A"))
        );
    }

    #[test]
    fn broken_pictures_fall_back_to_initials() {
        let cache = AvatarCache::default();
        cache.mark_broken("https://example.org/ana.png");
        assert_eq!(
            cache.resolve(&author("ana", Some("https://example.org/ana.png"))),
            Avatar::Initial(String::from("A"))
        );
        assert_eq!(
            cache.resolve(&author("ana", Some("https://example.org/ana2.png"))),
            Avatar::Url(String::from("https://example.org/ana2.png"))
        );
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let cache = AvatarCache::new(2, Duration::from_secs(60));
        cache.mark_broken("a");
        cache.mark_broken("b");
        cache.mark_broken("a");
        cache.mark_broken("c");
        assert_eq!(cache.len(), 2);
        assert!(!cache.is_broken("b"));
        assert!(cache.is_broken("a"));
        assert!(cache.is_broken("c"));
    }

    #[test]
    fn entries_expire() {
        let cache = AvatarCache::new(8, Duration::from_secs(10));
        let start = Instant::now();
        cache.mark_broken_at("a", start);
        assert!(cache.is_broken_at("a", start + Duration::from_secs(9)));
        assert!(!cache.is_broken_at("a", start + Duration::from_secs(10)));
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_empties() {
        let cache = AvatarCache::default();
        cache.mark_broken("a");
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.is_broken("a"));
    }
}
