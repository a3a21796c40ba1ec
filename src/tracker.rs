//! Inside-set bookkeeping for a single query.
//!
//! The tracker turns store change notifications into query transitions. It
//! remembers every entry it has seen in the covered ranges, so a key that
//! moves inside the covering set without crossing the radius produces no
//! event, and a key that leaves the radius produces exactly one `Exited`.

use crate::geohash::{GeoHash, HashRange};
use crate::spatial::Location;
use crate::storage::Entry;
use rustc_hash::FxHashMap;
use serde_json::Value;

/// A change in a key's relation to the query circle.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Entered {
        id: String,
        location: Location,
        data: Option<Value>,
    },
    Moved {
        id: String,
        location: Location,
        data: Option<Value>,
    },
    /// Payload changed in place; only produced when tracking data.
    Changed {
        id: String,
        location: Location,
        data: Option<Value>,
    },
    Exited {
        id: String,
        last_location: Location,
        data: Option<Value>,
    },
}

impl Transition {
    pub fn id(&self) -> &str {
        match self {
            Transition::Entered { id, .. }
            | Transition::Moved { id, .. }
            | Transition::Changed { id, .. }
            | Transition::Exited { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    location: Location,
    hash: GeoHash,
    data: Option<Value>,
    inside: bool,
}

/// Inside-set plus last-known state for every key seen in the covered ranges.
#[derive(Debug, Clone)]
pub struct ChangeTracker {
    center: Location,
    radius: f64,
    ranges: Vec<HashRange>,
    track_data: bool,
    known: FxHashMap<String, Tracked>,
}

impl ChangeTracker {
    pub fn new(
        center: Location,
        radius: f64,
        ranges: impl IntoIterator<Item = HashRange>,
        track_data: bool,
    ) -> Self {
        Self {
            center,
            radius,
            ranges: ranges.into_iter().collect(),
            track_data,
            known: FxHashMap::default(),
        }
    }

    pub fn center(&self) -> Location {
        self.center
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Feed scan results; returns an `Entered` for each new key inside.
    pub fn load(&mut self, entries: impl IntoIterator<Item = Entry>) -> Vec<Transition> {
        entries
            .into_iter()
            .filter_map(|entry| self.apply(&entry.id.clone(), Some(&entry)))
            .collect()
    }

    /// Classify one notification. `None` for `entry` means the key was removed.
    ///
    /// Applying the same notification twice yields nothing the second time.
    pub fn apply(&mut self, id: &str, entry: Option<&Entry>) -> Option<Transition> {
        let Some(entry) = entry else {
            let previous = self.known.remove(id)?;
            return previous.inside.then(|| Transition::Exited {
                id: id.to_string(),
                last_location: previous.location,
                data: previous.data,
            });
        };

        let is_inside = self.contains(&entry.location);
        let previous = if self.covers(entry.hash.as_str()) || is_inside {
            self.known.insert(
                id.to_string(),
                Tracked {
                    location: entry.location,
                    hash: entry.hash.clone(),
                    data: entry.data.clone(),
                    inside: is_inside,
                },
            )
        } else {
            self.known.remove(id)
        };
        let was_inside = previous.as_ref().is_some_and(|p| p.inside);

        let id = id.to_string();
        let location = entry.location;
        let data = entry.data.clone();
        match (was_inside, is_inside) {
            (false, true) => Some(Transition::Entered { id, location, data }),
            (true, false) => Some(Transition::Exited {
                id,
                last_location: location,
                data,
            }),
            (true, true) => {
                let previous = previous?;
                if previous.location != location {
                    Some(Transition::Moved { id, location, data })
                } else if self.track_data && previous.data != data {
                    Some(Transition::Changed { id, location, data })
                } else {
                    None
                }
            }
            (false, false) => None,
        }
    }

    /// Switch to new criteria. Known keys are reclassified against the new
    /// circle, then `added` (scan results for newly covered ranges) is applied.
    pub fn recenter(
        &mut self,
        center: Location,
        radius: f64,
        ranges: impl IntoIterator<Item = HashRange>,
        added: impl IntoIterator<Item = Entry>,
    ) -> Vec<Transition> {
        self.center = center;
        self.radius = radius;
        self.ranges = ranges.into_iter().collect();

        let mut ids: Vec<String> = self.known.keys().cloned().collect();
        ids.sort();

        let mut transitions = Vec::new();
        for id in ids {
            let Some(tracked) = self.known.get(&id) else {
                continue;
            };
            let location = tracked.location;
            let is_inside = self.contains(&location);
            let was_inside = tracked.inside;
            let data = tracked.data.clone();

            if !is_inside && !self.covers(tracked.hash.as_str()) {
                self.known.remove(&id);
            } else if let Some(tracked) = self.known.get_mut(&id) {
                tracked.inside = is_inside;
            }

            match (was_inside, is_inside) {
                (false, true) => transitions.push(Transition::Entered { id, location, data }),
                (true, false) => transitions.push(Transition::Exited {
                    id,
                    last_location: location,
                    data,
                }),
                _ => {}
            }
        }

        transitions.extend(added.into_iter().filter_map(|entry| {
            let id = entry.id.clone();
            self.apply(&id, Some(&entry))
        }));
        transitions
    }

    /// Identifiers currently inside, sorted.
    pub fn matched_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .known
            .iter()
            .filter(|(_, tracked)| tracked.inside)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_inside(&self, id: &str) -> bool {
        self.known.get(id).is_some_and(|t| t.inside)
    }

    pub fn inside_count(&self) -> usize {
        self.known.values().filter(|t| t.inside).count()
    }

    fn contains(&self, location: &Location) -> bool {
        location.distance_to(&self.center) <= self.radius
    }

    fn covers(&self, hash: &str) -> bool {
        self.ranges.iter().any(|range| range.contains(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geohash::covering_ranges;
    use serde_json::json;

    fn entry(id: &str, lat: f64, lon: f64) -> Entry {
        Entry::new(id, Location::new(lat, lon).unwrap(), 10).unwrap()
    }

    fn tracker(lat: f64, lon: f64, radius: f64, track_data: bool) -> ChangeTracker {
        let center = Location::new(lat, lon).unwrap();
        let ranges = covering_ranges(&center, radius, 10).unwrap();
        ChangeTracker::new(center, radius, ranges, track_data)
    }

    #[test]
    fn test_load_reports_only_inside_entries() {
        let mut tracker = tracker(0.0, 0.001, 500.0, false);
        let transitions = tracker.load(vec![entry("a", 0.0, 0.0), entry("far", 0.0, 0.05)]);

        assert_eq!(transitions.len(), 1);
        assert!(matches!(&transitions[0], Transition::Entered { id, .. } if id == "a"));
        assert_eq!(tracker.matched_ids(), vec!["a"]);
        assert!(!tracker.is_inside("far"));
    }

    #[test]
    fn test_transition_table() {
        let mut tracker = tracker(0.0, 0.0, 1000.0, false);

        // outside -> inside
        let t = tracker.apply("a", Some(&entry("a", 0.0, 0.001)));
        assert!(matches!(t, Some(Transition::Entered { .. })));

        // inside -> inside, new location
        let t = tracker.apply("a", Some(&entry("a", 0.001, 0.001)));
        assert!(matches!(t, Some(Transition::Moved { .. })));

        // same notification again
        assert_eq!(tracker.apply("a", Some(&entry("a", 0.001, 0.001))), None);

        // inside -> far away
        let t = tracker.apply("a", Some(&entry("a", 10.0, 10.0)));
        match t {
            Some(Transition::Exited { last_location, .. }) => {
                assert_eq!(last_location, Location::new(10.0, 10.0).unwrap())
            }
            other => panic!("expected exit, got {:?}", other),
        }
        assert_eq!(tracker.inside_count(), 0);

        // outside -> outside
        assert_eq!(tracker.apply("a", Some(&entry("a", 11.0, 11.0))), None);
        // removal of a key that was never inside
        assert_eq!(tracker.apply("a", None), None);
    }

    #[test]
    fn test_removal_exits_with_previous_location() {
        let mut tracker = tracker(0.0, 0.0, 1000.0, true);
        tracker.load(vec![entry("a", 0.0, 0.0).with_data(Some(json!(1)))]);

        match tracker.apply("a", None) {
            Some(Transition::Exited {
                last_location,
                data,
                ..
            }) => {
                assert_eq!(last_location, Location::new(0.0, 0.0).unwrap());
                assert_eq!(data, Some(json!(1)));
            }
            other => panic!("expected exit, got {:?}", other),
        }
        assert_eq!(tracker.apply("a", None), None);
    }

    #[test]
    fn test_payload_change_only_reported_when_tracking_data() {
        let mut plain = tracker(0.0, 0.0, 1000.0, false);
        let mut with_data = tracker(0.0, 0.0, 1000.0, true);
        for t in [&mut plain, &mut with_data] {
            t.load(vec![entry("a", 0.0, 0.0).with_data(Some(json!("old")))]);
        }

        let updated = entry("a", 0.0, 0.0).with_data(Some(json!("new")));
        assert_eq!(plain.apply("a", Some(&updated)), None);
        assert!(matches!(
            with_data.apply("a", Some(&updated)),
            Some(Transition::Changed { data: Some(_), .. })
        ));
    }

    #[test]
    fn test_move_within_covering_set_but_outside_radius_is_silent() {
        let mut tracker = tracker(0.0, 0.0, 100.0, false);
        // ~550m away: likely still in the covering cells but outside the circle
        assert_eq!(tracker.apply("a", Some(&entry("a", 0.0, 0.005))), None);
        let t = tracker.apply("a", Some(&entry("a", 0.0, 0.0005)));
        assert!(matches!(t, Some(Transition::Entered { .. })));
    }

    #[test]
    fn test_recenter_reclassifies_known_keys() {
        let mut tracker = tracker(0.0, 0.0, 1000.0, false);
        tracker.load(vec![entry("a", 0.0, 0.0), entry("b", 0.0, 0.012)]);
        assert_eq!(tracker.matched_ids(), vec!["a"]);

        let center = Location::new(0.0, 0.012).unwrap();
        let ranges = covering_ranges(&center, 1000.0, 10).unwrap();
        let added = vec![entry("b", 0.0, 0.012), entry("c", 0.0, 0.013)];
        let transitions = tracker.recenter(center, 1000.0, ranges, added);

        let summary: Vec<(&str, &str)> = transitions
            .iter()
            .map(|t| {
                let kind = match t {
                    Transition::Entered { .. } => "entered",
                    Transition::Exited { .. } => "exited",
                    Transition::Moved { .. } => "moved",
                    Transition::Changed { .. } => "changed",
                };
                (t.id(), kind)
            })
            .collect();
        assert!(summary.contains(&("a", "exited")));
        assert!(summary.contains(&("b", "entered")));
        assert!(summary.contains(&("c", "entered")));
        assert_eq!(summary.len(), 3);
        assert_eq!(tracker.matched_ids(), vec!["b", "c"]);
        assert_eq!(tracker.center(), center);
    }
}
