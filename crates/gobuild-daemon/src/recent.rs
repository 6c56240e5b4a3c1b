use std::collections::VecDeque;

use parking_lot::Mutex;

/// How many recent successful builds the landing page shows.
const RECENT_CAP: usize = 10;

/// Bounded ring of the most recently published build links.
#[derive(Debug, Default)]
pub struct RecentBuilds {
    links: Mutex<VecDeque<String>>,
}

impl RecentBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, link: String) {
        let mut links = self.links.lock();
        if links.len() == RECENT_CAP {
            links.pop_front();
        }
        links.push_back(link);
    }

    /// Most recent first.
    pub fn links(&self) -> Vec<String> {
        self.links.lock().iter().rev().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_ten_most_recent_first() {
        let recent = RecentBuilds::new();
        for i in 0..13 {
            recent.add(format!("/m{i}/"));
        }
        let links = recent.links();
        assert_eq!(links.len(), 10);
        assert_eq!(links[0], "/m12/");
        assert_eq!(links[9], "/m3/");
    }
}
