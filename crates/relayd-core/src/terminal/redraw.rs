//! Cross-delivery redraw suppression
//!
//! Full-screen programs repaint regions they already drew. Once cursor
//! positioning has been turned into line breaks, a repaint shows up as lines
//! the thread has already seen. The filter remembers recently delivered
//! lines and drops them when a later delivery repeats them. Repeats within a
//! single delivery are content and are kept.

use std::collections::{HashSet, VecDeque};

/// Lines shorter than this are too generic to treat as repaints (`}`, `ok`)
const MIN_TRACKED_CHARS: usize = 8;

#[derive(Debug)]
pub struct RedrawFilter {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Default for RedrawFilter {
    fn default() -> Self {
        Self::new(200)
    }
}

impl RedrawFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Drop lines delivered earlier, then remember this delivery's lines
    pub fn filter(&mut self, lines: Vec<String>) -> Vec<String> {
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|line| !(Self::tracked(line) && self.seen.contains(line.trim())))
            .collect();

        for line in &kept {
            if Self::tracked(line) {
                self.remember(line.trim().to_string());
            }
        }
        kept
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }

    fn tracked(line: &str) -> bool {
        line.trim().chars().count() >= MIN_TRACKED_CHARS
    }

    fn remember(&mut self, line: String) {
        if self.seen.contains(&line) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(line.clone());
        self.order.push_back(line);
    }
}
