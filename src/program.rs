//! Program model and the per-channel interval index.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// How many buffered programs (current one included) a channel must still
/// have ahead of it to count as fresh.
pub const FRESHNESS_BUFFER: usize = 3;

/// One EPG entry, airing over the half-open interval `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub has_archive: bool,
}

impl Program {
    pub fn is_at(&self, t: DateTime<Utc>) -> bool {
        self.begin <= t && t < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.begin
    }

    pub fn elapsed(&self, t: DateTime<Utc>) -> Duration {
        t - self.begin
    }

    pub fn remaining(&self, t: DateTime<Utc>) -> Duration {
        self.end - t
    }

    /// Fraction of the program already aired at `t`, clamped to `[0, 1]`.
    pub fn progress(&self, t: DateTime<Utc>) -> f64 {
        let total = self.duration().num_milliseconds();
        if total <= 0 {
            return 0.0;
        }
        let passed = self.elapsed(t).num_milliseconds() as f64 / total as f64;
        passed.clamp(0.0, 1.0)
    }
}

/// Sorted programs of a single channel with a lookup cursor.
///
/// Instances are never mutated after construction except for the cursor,
/// which only affects lookup speed. New data means a new instance.
///
/// Lookup is a two step algorithm:
/// 1. check the cursor and the slot after it, which answers monotonically
///    advancing queries (a clock ticking forward) in O(1);
/// 2. otherwise binary search for the first program with `end > t`, move the
///    cursor there and check whether it actually contains `t`.
#[derive(Debug, Default)]
pub struct IntervalCache {
    programs: Vec<Program>,
    cursor: AtomicUsize,
}

impl IntervalCache {
    pub fn new(mut programs: Vec<Program>) -> Self {
        programs.sort_by_key(|p| p.end);
        Self {
            programs,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Program airing at `t` and the one after it.
    pub fn find(&self, t: DateTime<Utc>) -> (Option<&Program>, Option<&Program>) {
        match self.locate(t) {
            Some(i) => (self.programs.get(i), self.programs.get(i + 1)),
            None => (None, None),
        }
    }

    pub fn current(&self, t: DateTime<Utc>) -> Option<&Program> {
        self.find(t).0
    }

    /// Current program plus up to two following ones; empty when nothing airs at `t`.
    pub fn current_and_following(&self, t: DateTime<Utc>) -> &[Program] {
        match self.locate(t) {
            Some(i) => {
                let end = (i + FRESHNESS_BUFFER).min(self.programs.len());
                &self.programs[i..end]
            }
            None => &[],
        }
    }

    /// Begin of the program `FRESHNESS_BUFFER` slots from the end. Once the
    /// clock passes it fewer than that many programs remain buffered.
    pub fn expiry_time(&self) -> Option<DateTime<Utc>> {
        let len = self.programs.len();
        if len < FRESHNESS_BUFFER {
            return None;
        }
        Some(self.programs[len - FRESHNESS_BUFFER].begin)
    }

    pub fn is_stale(&self, t: DateTime<Utc>) -> bool {
        match self.expiry_time() {
            Some(expiry) => expiry < t,
            None => true,
        }
    }

    fn matches(&self, i: usize, t: DateTime<Utc>) -> bool {
        self.programs.get(i).is_some_and(|p| p.is_at(t))
    }

    fn locate(&self, t: DateTime<Utc>) -> Option<usize> {
        let pos = self.cursor.load(Ordering::Relaxed);
        if self.matches(pos, t) {
            return Some(pos);
        }
        if self.matches(pos + 1, t) {
            self.cursor.store(pos + 1, Ordering::Relaxed);
            return Some(pos + 1);
        }

        // a boundary instant belongs to the program that starts there
        let idx = self.programs.partition_point(|p| p.end <= t);
        self.cursor.store(idx, Ordering::Relaxed);
        self.matches(idx, t).then_some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn program(begin: i64, end: i64) -> Program {
        Program {
            begin: at(begin),
            end: at(end),
            title: format!("{begin}-{end}"),
            description: String::new(),
            has_archive: false,
        }
    }

    fn spans(cache: &IntervalCache, t: i64) -> (Option<(i64, i64)>, Option<(i64, i64)>) {
        let (cur, nxt) = cache.find(at(t));
        let span = |p: &Program| (p.begin.timestamp(), p.end.timestamp());
        (cur.map(span), nxt.map(span))
    }

    fn full_scan(programs: &[Program], t: DateTime<Utc>) -> (Option<&Program>, Option<&Program>) {
        for (i, p) in programs.iter().enumerate() {
            if p.is_at(t) {
                return (Some(p), programs.get(i + 1));
            }
        }
        (None, None)
    }

    #[test]
    fn test_find_at_boundaries() {
        let cache = IntervalCache::new(vec![program(0, 10), program(10, 20), program(20, 30)]);

        assert_eq!(spans(&cache, 9), (Some((0, 10)), Some((10, 20))));
        assert_eq!(spans(&cache, 10), (Some((10, 20)), Some((20, 30))));
        assert_eq!(spans(&cache, 29), (Some((20, 30)), None));
        assert_eq!(spans(&cache, 30), (None, None));
        assert_eq!(spans(&cache, -1), (None, None));
    }

    #[test]
    fn test_find_in_gap_is_empty() {
        let cache = IntervalCache::new(vec![program(0, 10), program(15, 20)]);
        assert_eq!(spans(&cache, 12), (None, None));
        assert_eq!(spans(&cache, 15), (Some((15, 20)), None));
        // going backwards after the cursor moved forward
        assert_eq!(spans(&cache, 3), (Some((0, 10)), Some((15, 20))));
    }

    #[test]
    fn test_empty_cache() {
        let cache = IntervalCache::new(Vec::new());
        assert_eq!(spans(&cache, 0), (None, None));
        assert!(cache.is_stale(at(0)));
        assert!(cache.current_and_following(at(0)).is_empty());
    }

    #[test]
    fn test_cursor_matches_full_scan() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let mut programs = Vec::new();
            let mut t = rng.gen_range(0..100);
            for _ in 0..rng.gen_range(0..30) {
                // optional gap, then a program of random length
                t += rng.gen_range(0..3) * rng.gen_range(0..20);
                let len = rng.gen_range(1..60);
                programs.push(program(t, t + len));
                t += len;
            }
            let cache = IntervalCache::new(programs.clone());
            let horizon = t + 20;

            // monotonic sweep
            for q in -5..horizon {
                assert_eq!(cache.find(at(q)), full_scan(&programs, at(q)), "t={q}");
            }
            // random order
            for _ in 0..200 {
                let q = rng.gen_range(-5..horizon);
                assert_eq!(cache.find(at(q)), full_scan(&programs, at(q)), "t={q}");
            }
        }
    }

    #[test]
    fn test_expiry_time_is_third_from_last_begin() {
        assert_eq!(IntervalCache::new(vec![]).expiry_time(), None);
        assert_eq!(IntervalCache::new(vec![program(0, 10)]).expiry_time(), None);
        assert_eq!(
            IntervalCache::new(vec![program(0, 10), program(10, 20)]).expiry_time(),
            None
        );

        let cache = IntervalCache::new(vec![
            program(0, 10),
            program(10, 20),
            program(20, 30),
            program(30, 40),
        ]);
        assert_eq!(cache.expiry_time(), Some(at(10)));
        assert!(!cache.is_stale(at(5)));
        assert!(!cache.is_stale(at(10)));
        assert!(cache.is_stale(at(11)));
    }

    #[test]
    fn test_current_and_following() {
        let cache = IntervalCache::new(vec![
            program(0, 10),
            program(10, 20),
            program(20, 30),
            program(30, 40),
        ]);
        let titles: Vec<_> = cache
            .current_and_following(at(12))
            .iter()
            .map(|p| p.title.as_str())
            .collect();
        assert_eq!(titles, vec!["10-20", "20-30", "30-40"]);
        assert_eq!(cache.current_and_following(at(35)).len(), 1);
        assert!(cache.current_and_following(at(50)).is_empty());
    }

    #[test]
    fn test_unsorted_input_is_sorted_by_end() {
        let cache = IntervalCache::new(vec![program(20, 30), program(0, 10), program(10, 20)]);
        assert_eq!(spans(&cache, 25), (Some((20, 30)), None));
        assert_eq!(cache.programs()[0].begin, at(0));
    }

    #[test]
    fn test_program_progress() {
        let p = program(100, 200);
        assert_eq!(p.progress(at(150)), 0.5);
        assert_eq!(p.progress(at(50)), 0.0);
        assert_eq!(p.progress(at(250)), 1.0);
        assert_eq!(p.remaining(at(150)).num_seconds(), 50);
        assert_eq!(p.duration().num_seconds(), 100);
    }
}
