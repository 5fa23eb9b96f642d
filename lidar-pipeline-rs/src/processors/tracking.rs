//! Frame-to-frame object identity by greedy nearest-centroid matching.

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::config::NearestNeighbourParams;
use crate::core::points::{distance, Point};

/// One tracked object.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: u64,
    pub last_centroid: Point,
    /// Consecutive updates in which the track was not matched
    pub missing_count: u32,
}

/// Assigns stable ids to cluster centroids across frames.
///
/// Every update matches (track, centroid) pairs greedily in increasing
/// distance. Unmatched centroids start new tracks; unmatched tracks age and
/// are dropped once their missing count exceeds `max_missing`. Ids are never
/// reused until [`restart`](Self::restart).
#[derive(Debug, Clone)]
pub struct Tracker {
    max_missing: u32,
    next_id: u64,
    tracks: BTreeMap<u64, Track>,
    mapping: Vec<u64>,
}

impl Tracker {
    pub fn new(params: &NearestNeighbourParams) -> Self {
        Self {
            max_missing: params.max_missing,
            next_id: 0,
            tracks: BTreeMap::new(),
            mapping: Vec::new(),
        }
    }

    pub fn max_missing(&self) -> u32 {
        self.max_missing
    }

    /// Live tracks ordered by id.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Track id assigned to each centroid of the last update, by input index.
    pub fn input_mapping(&self) -> &[u64] {
        &self.mapping
    }

    /// Forget all tracks and reset the id counter.
    pub fn restart(&mut self) {
        self.next_id = 0;
        self.tracks.clear();
        self.mapping.clear();
    }

    fn register(&mut self, centroid: Point) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.insert(
            id,
            Track {
                id,
                last_centroid: centroid,
                missing_count: 0,
            },
        );
        trace!("registered track {} at {:?}", id, centroid);
        id
    }

    /// Age a track, dropping it once it has been missing too long.
    fn mark_missing(&mut self, id: u64) {
        let expired = match self.tracks.get_mut(&id) {
            Some(track) => {
                track.missing_count += 1;
                track.missing_count > self.max_missing
            }
            None => false,
        };
        if expired {
            self.tracks.remove(&id);
            debug!("deregistered track {}", id);
        }
    }

    /// Feed the centroids of one frame. Returns the track id of each input
    /// centroid, in input order.
    pub fn update(&mut self, centroids: &[Point]) -> &[u64] {
        self.mapping.clear();

        if centroids.is_empty() {
            let ids: Vec<u64> = self.tracks.keys().copied().collect();
            for id in ids {
                self.mark_missing(id);
            }
            return &self.mapping;
        }

        if self.tracks.is_empty() {
            for &c in centroids {
                let id = self.register(c);
                self.mapping.push(id);
            }
            return &self.mapping;
        }

        let track_ids: Vec<u64> = self.tracks.keys().copied().collect();

        // All pairs, ordered by distance; ties resolve by track then input.
        let mut pairs: Vec<(usize, usize, f32)> =
            Vec::with_capacity(track_ids.len() * centroids.len());
        for (row, id) in track_ids.iter().enumerate() {
            let last = self.tracks[id].last_centroid;
            for (col, c) in centroids.iter().enumerate() {
                pairs.push((row, col, distance(&last, c)));
            }
        }
        pairs.sort_by(|a, b| a.2.total_cmp(&b.2));

        let mut used_rows = vec![false; track_ids.len()];
        let mut assigned: Vec<Option<u64>> = vec![None; centroids.len()];
        for (row, col, _) in pairs {
            if used_rows[row] || assigned[col].is_some() {
                continue;
            }
            used_rows[row] = true;
            let id = track_ids[row];
            assigned[col] = Some(id);
            if let Some(track) = self.tracks.get_mut(&id) {
                track.last_centroid = centroids[col];
                track.missing_count = 0;
            }
        }

        for (row, used) in used_rows.iter().enumerate() {
            if !used {
                self.mark_missing(track_ids[row]);
            }
        }

        let mut mapping = Vec::with_capacity(centroids.len());
        for (col, slot) in assigned.into_iter().enumerate() {
            let id = match slot {
                Some(id) => id,
                None => self.register(centroids[col]),
            };
            mapping.push(id);
        }
        self.mapping = mapping;
        &self.mapping
    }
}
