use mesh_pilot_core::{ChangeEvent, ConfigKey, ConfigObject, Conflict};
use std::{collections::BTreeMap, sync::Arc};

/// The merged view over all sources.
///
/// Each key holds the claims of every source that published it; the claim of
/// the source with the lowest index (the first registered) is visible.
#[derive(Debug)]
pub(crate) struct Index {
    sources: Vec<String>,
    entries: BTreeMap<ConfigKey, Claims>,
}

#[derive(Debug, Default)]
struct Claims(BTreeMap<usize, Arc<ConfigObject>>);

/// The effect of applying one source event to the index.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Outcome {
    /// The change visible to subscribers, if any.
    pub event: Option<ChangeEvent>,

    /// Set when the event created or touched a shadowed claim.
    pub conflict: Option<Conflict>,
}

// === impl Index ===

impl Index {
    pub(crate) fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &ConfigKey) -> Option<Arc<ConfigObject>> {
        self.entries
            .get(key)
            .and_then(Claims::winner)
            .map(|(_, obj)| obj.clone())
    }

    pub(crate) fn list(&self, kind: &str) -> Vec<Arc<ConfigObject>> {
        self.entries
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter_map(|(_, claims)| claims.winner())
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Keys for which `source` holds a claim, visible or shadowed.
    pub(crate) fn claimed_by(&self, source: usize) -> Vec<ConfigKey> {
        self.entries
            .iter()
            .filter(|(_, claims)| claims.0.contains_key(&source))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn kinds(&self) -> BTreeMap<&str, usize> {
        let mut kinds = BTreeMap::new();
        for key in self.entries.keys() {
            *kinds.entry(key.kind.as_str()).or_default() += 1;
        }
        kinds
    }

    /// All keys currently claimed by more than one source.
    pub(crate) fn conflicts(&self) -> Vec<Conflict> {
        let mut conflicts = vec![];
        for (key, claims) in &self.entries {
            let mut sources = claims.0.keys();
            let Some(&winner) = sources.next() else {
                continue;
            };
            for &loser in sources {
                conflicts.push(self.conflict(key, winner, loser));
            }
        }
        conflicts
    }

    pub(crate) fn apply(&mut self, source: usize, event: ChangeEvent) -> Outcome {
        match event {
            ChangeEvent::Added(obj) | ChangeEvent::Updated(obj) => self.upsert(source, obj),
            ChangeEvent::Deleted(key) => self.remove(source, key),
        }
    }

    fn upsert(&mut self, source: usize, obj: Arc<ConfigObject>) -> Outcome {
        let key = obj.key.clone();
        let claims = self.entries.entry(key.clone()).or_default();

        if let Some(current) = claims.0.get(&source) {
            if current.revision == obj.revision {
                tracing::trace!(%key, revision = %obj.revision, "Ignoring unchanged object");
                return Outcome::default();
            }
        }

        let prior = claims.winner().map(|(idx, _)| idx);
        claims.0.insert(source, obj.clone());
        let winner = prior.map_or(source, |prior| prior.min(source));

        let event = match prior {
            None => Some(ChangeEvent::Added(obj)),
            Some(_) if winner == source => Some(ChangeEvent::Updated(obj)),
            Some(_) => None,
        };

        let conflict = match prior {
            Some(prior) if winner == source && prior != source => {
                Some(self.conflict(&key, winner, prior))
            }
            Some(_) if winner != source => Some(self.conflict(&key, winner, source)),
            _ => None,
        };

        Outcome { event, conflict }
    }

    fn remove(&mut self, source: usize, key: ConfigKey) -> Outcome {
        let Some(claims) = self.entries.get_mut(&key) else {
            return Outcome::default();
        };
        let prior = claims.winner().map(|(idx, _)| idx);
        if claims.0.remove(&source).is_none() {
            return Outcome::default();
        }

        let next = claims.winner().map(|(_, obj)| obj.clone());
        let event = match next {
            None => {
                self.entries.remove(&key);
                Some(ChangeEvent::Deleted(key))
            }
            // A shadowed claim becomes visible.
            Some(obj) if prior == Some(source) => Some(ChangeEvent::Updated(obj)),
            Some(_) => None,
        };

        Outcome {
            event,
            conflict: None,
        }
    }

    fn conflict(&self, key: &ConfigKey, winner: usize, loser: usize) -> Conflict {
        Conflict {
            key: key.clone(),
            winner: self.sources[winner].clone(),
            loser: self.sources[loser].clone(),
        }
    }
}

// === impl Claims ===

impl Claims {
    fn winner(&self) -> Option<(usize, &Arc<ConfigObject>)> {
        self.0.iter().next().map(|(idx, obj)| (*idx, obj))
    }
}
