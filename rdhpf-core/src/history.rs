// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A ring buffer of recently removed forwards (spec.md 3, 4.4), capped
//! both by count and by age, whichever is tighter.

use std::{collections::VecDeque, sync::Mutex};

use chrono::{DateTime, Utc};
use rdhpf_protocol::FinalStatus;

use crate::consts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub container_id: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: String,
    pub final_status: FinalStatus,
}

#[derive(Default)]
pub struct History {
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl History {
    pub fn new() -> Self {
        History::default()
    }

    /// Append an entry, then trim to satisfy both caps (spec.md 3:
    /// `len <= 100` and every `ended_at` within the past hour).
    pub fn add(&self, entry: HistoryEntry, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(entry);
        trim(&mut entries, now);
    }

    pub fn get_all(&self) -> Vec<HistoryEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

fn trim(entries: &mut VecDeque<HistoryEntry>, now: DateTime<Utc>) {
    while entries.len() > consts::HISTORY_MAX_ENTRIES {
        entries.pop_front();
    }
    while let Some(front) = entries.front() {
        let age = (now - front.ended_at).to_std().unwrap_or_default();
        if age > consts::HISTORY_MAX_AGE {
            entries.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(port: u16, ended_at: DateTime<Utc>) -> HistoryEntry {
        HistoryEntry {
            container_id: "c1".to_string(),
            port,
            started_at: ended_at,
            ended_at,
            end_reason: "container stopped".to_string(),
            final_status: FinalStatus::Active,
        }
    }

    #[test]
    fn caps_by_count() {
        let h = History::new();
        for i in 0..150u16 {
            h.add(entry(i, t(i as i64)), t(200));
        }
        assert_eq!(h.count(), consts::HISTORY_MAX_ENTRIES);
        // the oldest entries should have been evicted first
        let all = h.get_all();
        assert_eq!(all.first().unwrap().port, 50);
    }

    #[test]
    fn caps_by_age() {
        let h = History::new();
        h.add(entry(1, t(0)), t(0));
        // an hour and one second later, the old entry should fall out
        h.add(entry(2, t(3601)), t(3601));
        assert_eq!(h.count(), 1);
        assert_eq!(h.get_all()[0].port, 2);
    }

    #[test]
    fn clear_empties_history() {
        let h = History::new();
        h.add(entry(1, t(0)), t(0));
        h.clear();
        assert_eq!(h.count(), 0);
    }
}
