//! # Synthetic Master Projection
//!
//! Builds the externally visible view of a Master by aggregating every Local
//! attached to it.
//!
//! - Collections (identifiers, names, addresses) are unioned and de-duplicated
//!   by natural key.
//! - Scalars (birth date, gender) come from the most recently modified Local
//!   that has a value; ties go to the earliest created Local.
//! - A restricted Local still contributes identifiers, but its demographics
//!   are withheld from principals lacking the restricting policy.
//! - The Master's own administrative identifiers are always present.

use crate::error::{MdmError, Result};
use crate::model::{Principal, Record, RecordKey};
use crate::repository::RecordRepository;
use crate::store::RelationshipStore;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Cached projection of one master.
///
/// `generation` moves on every invalidation; a projection built from reads
/// taken under an older generation is never stored.
#[derive(Debug, Default)]
struct CacheSlot {
    generation: u64,
    projection: Option<Arc<Record>>,
}

/// Computes and caches Master projections
pub struct SyntheticMasterProjector {
    repository: Arc<dyn RecordRepository>,
    relationships: Arc<dyn RelationshipStore>,
    system_policy: String,
    /// Unredacted projections keyed by master
    cache: DashMap<RecordKey, CacheSlot>,
}

impl SyntheticMasterProjector {
    pub fn new(
        repository: Arc<dyn RecordRepository>,
        relationships: Arc<dyn RelationshipStore>,
        system_policy: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            relationships,
            system_policy: system_policy.into(),
            cache: DashMap::new(),
        }
    }

    /// Whether `principal` may see the demographics of `local`
    pub fn can_see(&self, local: &Record, principal: &Principal) -> bool {
        match local.restriction() {
            None => true,
            Some(policy) => {
                principal.has_policy(policy) || principal.has_policy(&self.system_policy)
            }
        }
    }

    /// Projection of `master` as seen by `principal`
    pub fn project(&self, master: RecordKey, principal: &Principal) -> Result<Record> {
        let generation = self.generation(master);
        let (shell, locals) = self.load(master, None)?;
        if locals.iter().all(|local| self.can_see(local, principal)) {
            if let Some(cached) = self
                .cache
                .get(&master)
                .and_then(|slot| slot.projection.clone())
            {
                return Ok(cached.as_ref().clone());
            }
            let projected = build_projection(&shell, &locals, |_| true);
            self.store(master, generation, &projected);
            return Ok(projected);
        }
        trace!(%master, principal = %principal, "projecting with redaction");
        Ok(build_projection(&shell, &locals, |local| {
            self.can_see(local, principal)
        }))
    }

    /// Unredacted projection of `master` leaving out one Local.
    ///
    /// Matchers use this to compare a Local against its own master without
    /// the Local's contribution.
    pub fn project_excluding(&self, master: RecordKey, exclude: RecordKey) -> Result<Record> {
        let (shell, locals) = self.load(master, Some(exclude))?;
        Ok(build_projection(&shell, &locals, |_| true))
    }

    /// Recompute and cache the unredacted projection after committed edge changes.
    ///
    /// The old projection is dropped first. A failed rebuild is logged and
    /// leaves the cache empty, so the next read recomputes it.
    pub fn refresh(&self, master: RecordKey) {
        self.invalidate(master);
        let generation = self.generation(master);
        match self.load(master, None) {
            Ok((shell, locals)) => {
                let projected = build_projection(&shell, &locals, |_| true);
                self.store(master, generation, &projected);
                debug!(%master, locals = locals.len(), "projection refreshed");
            }
            Err(err) => warn!(%master, error = %err, "projection refresh failed"),
        }
    }

    /// Drop the cached projection; builds already in flight will not be stored
    pub fn invalidate(&self, master: RecordKey) {
        let mut slot = self.cache.entry(master).or_default();
        slot.generation += 1;
        slot.projection = None;
    }

    #[cfg(test)]
    pub(crate) fn is_cached(&self, master: RecordKey) -> bool {
        self.cache
            .get(&master)
            .map_or(false, |slot| slot.projection.is_some())
    }

    fn generation(&self, master: RecordKey) -> u64 {
        self.cache.get(&master).map_or(0, |slot| slot.generation)
    }

    /// Cache `projected` unless the master was invalidated since `generation`
    fn store(&self, master: RecordKey, generation: u64, projected: &Record) {
        let mut slot = self.cache.entry(master).or_default();
        if slot.generation == generation {
            slot.projection = Some(Arc::new(projected.clone()));
        } else {
            trace!(%master, "projection outdated before caching; dropped");
        }
    }

    fn load(&self, master: RecordKey, exclude: Option<RecordKey>) -> Result<(Record, Vec<Record>)> {
        let shell = self
            .repository
            .fetch(master)
            .ok_or_else(|| MdmError::NotFound(format!("master {master}")))?;
        if !shell.is_master() {
            return Err(MdmError::InvalidOperation(format!(
                "record {master} is not a master"
            )));
        }
        let locals = self
            .relationships
            .locals_of(master)
            .into_iter()
            .filter(|key| Some(*key) != exclude)
            .filter_map(|key| self.repository.fetch(key))
            .filter(|local| !local.obsoleted)
            .collect();
        Ok((shell, locals))
    }
}

/// Aggregate `locals` onto the master shell.
///
/// `visible` decides whether a Local's demographics are included; its
/// identifiers are included either way.
fn build_projection(shell: &Record, locals: &[Record], visible: impl Fn(&Record) -> bool) -> Record {
    let mut ordered: Vec<&Record> = locals.iter().collect();
    ordered.sort_by(|a, b| {
        b.modified_at
            .cmp(&a.modified_at)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.key.cmp(&b.key))
    });

    let mut projected = shell.clone();
    projected.relationship_assertions.clear();

    let mut identifier_keys: HashSet<(String, String)> = projected
        .identifiers
        .iter()
        .map(|identifier| identifier.natural_key())
        .collect();
    let mut name_keys: HashSet<(String, String)> =
        projected.names.iter().map(|name| name.natural_key()).collect();
    let mut address_keys: HashSet<String> = projected
        .addresses
        .iter()
        .map(|address| address.natural_key())
        .collect();

    for local in &ordered {
        for identifier in &local.identifiers {
            if identifier_keys.insert(identifier.natural_key()) {
                projected.identifiers.push(identifier.clone());
            }
        }

        if !visible(local) {
            continue;
        }

        for name in &local.names {
            if name_keys.insert(name.natural_key()) {
                projected.names.push(name.clone());
            }
        }
        for address in &local.addresses {
            if address_keys.insert(address.natural_key()) {
                projected.addresses.push(address.clone());
            }
        }
        if projected.birth_date.is_none() {
            projected.birth_date = local.birth_date;
        }
        if projected.gender.is_none() {
            projected.gender = local.gender.clone();
        }
        if local.modified_at > projected.modified_at {
            projected.modified_at = local.modified_at;
        }
    }

    projected
}
