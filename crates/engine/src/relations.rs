use std::collections::BTreeMap;

use remap_core::{
    Context, EntityKind, FieldMap, FieldValue, NativeId, RecordRef, RemoteId, StorageLocation,
};
use remap_storage::{IdentityStore, PendingRelation, Storage, WriteTarget};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Relation fields after lookup against the identity store.
#[derive(Debug, Default)]
pub(crate) struct RelationLookup {
    /// Every relation field present in the payload, with the remote ids that
    /// did not resolve. An empty list clears the field's pending slot.
    pub slots: BTreeMap<String, Vec<String>>,
}

/// Rewrites the kind's relation fields in `payload` from remote ids to
/// `Refs`. Targets that are not bound yet are left out of the value and
/// returned so they can be registered as pending.
pub(crate) fn resolve_relations<S: IdentityStore + ?Sized>(
    storage: &S,
    config: &EngineConfig,
    kind: &EntityKind,
    payload: &mut FieldMap,
) -> Result<RelationLookup, EngineError> {
    let mut lookup = RelationLookup::default();

    for field in config.relation_fields(kind) {
        let Some(value) = payload.get(field) else {
            continue;
        };
        if matches!(value, FieldValue::Refs(_)) {
            continue;
        }
        let Some(ids) = value.remote_ids() else {
            return Err(EngineError::InvalidArgument(format!(
                "relation field `{field}` must hold remote ids"
            )));
        };

        let mut refs = Vec::new();
        let mut unresolved = Vec::new();
        for raw in ids {
            let remote_id = RemoteId::parse(&raw)?;
            match storage.resolve(&remote_id)? {
                Some(target) if !refs.contains(&target) => refs.push(target),
                Some(_) => {}
                None if !unresolved.contains(&raw) => unresolved.push(raw),
                None => {}
            }
        }

        debug!(
            field = %field,
            resolved = refs.len(),
            unresolved = unresolved.len(),
            "relation field looked up"
        );
        payload.insert(field.clone(), FieldValue::Refs(refs));
        lookup.slots.insert(field.clone(), unresolved);
    }

    Ok(lookup)
}

/// Outcome of reading the location field of a new record.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    At(StorageLocation),
    /// The parent named by remote id is not bound yet.
    WaitingOn(RemoteId),
}

/// Picks the storage location for a new record and strips the location
/// field from `payload`.
pub(crate) fn resolve_location<S: IdentityStore + ?Sized>(
    storage: &S,
    config: &EngineConfig,
    kind: &EntityKind,
    payload: &mut FieldMap,
) -> Result<Placement, EngineError> {
    let requested = payload.remove(&config.location_field);

    if config.is_root_level(kind) {
        return Ok(Placement::At(StorageLocation::TOP_LEVEL));
    }

    match requested {
        Some(FieldValue::Text(raw)) => {
            let parent = RemoteId::parse(&raw)?;
            return match storage.resolve(&parent)? {
                Some(record) => Ok(Placement::At(record.native_id.into())),
                None => Ok(Placement::WaitingOn(parent)),
            };
        }
        Some(FieldValue::Integer(raw)) => return Ok(Placement::At(StorageLocation::new(raw)?)),
        Some(FieldValue::Null) | None => {}
        Some(_) => {
            return Err(EngineError::InvalidArgument(format!(
                "location field `{}` must hold a remote id or a native location",
                config.location_field
            )));
        }
    }

    let fallback = config
        .kind(kind)
        .and_then(|k| k.default_location)
        .or(config.default_location);
    match fallback {
        Some(raw) => Ok(Placement::At(StorageLocation::new(raw)?)),
        None => Ok(Placement::At(StorageLocation::TOP_LEVEL)),
    }
}

/// Completes every pending relation waiting on `remote_id`, now bound to
/// `target`. Each owner's relation value gets `target` appended. Owners the
/// persistence engine reports as deleted are dropped without patching.
///
/// Must run in the same storage scope as the bind that triggered it.
pub(crate) fn resolve_pending<S: Storage + ?Sized>(
    storage: &mut S,
    remote_id: &RemoteId,
    target: &RecordRef,
) -> Result<Vec<PendingRelation>, EngineError> {
    let waiting = storage.take_by_target(remote_id)?;
    let mut patched = Vec::with_capacity(waiting.len());

    for relation in waiting {
        if storage.was_deleted(&relation.kind, relation.owner)? {
            warn!(
                owner = %RecordRef::new(relation.kind.clone(), relation.owner),
                field = %relation.field,
                target = %remote_id,
                "dropping pending relation of deleted owner"
            );
            continue;
        }

        let current = storage.fetch_field(&relation.kind, relation.owner, &relation.field)?;
        let current = current.as_ref().and_then(FieldValue::as_refs).unwrap_or_default();
        let mut refs = Vec::with_capacity(current.len() + 1);
        for existing in current {
            if storage.was_deleted(&existing.kind, existing.native_id)? {
                debug!(
                    owner = %RecordRef::new(relation.kind.clone(), relation.owner),
                    field = %relation.field,
                    dropped = %existing,
                    "dropping reference to deleted record"
                );
                continue;
            }
            refs.push(existing.clone());
        }
        if !refs.contains(target) {
            refs.push(target.clone());
        }

        let mut change = FieldMap::new();
        change.insert(relation.field.clone(), FieldValue::Refs(refs));
        storage.apply_field_changes(
            &relation.kind,
            WriteTarget::Existing(relation.owner),
            &change,
            &Context::default(),
        )?;
        debug!(
            owner = %RecordRef::new(relation.kind.clone(), relation.owner),
            field = %relation.field,
            target = %target,
            "pending relation patched"
        );
        patched.push(relation);
    }

    Ok(patched)
}

/// Completes the pending relations of `lookup` whose target got bound after
/// the lookup ran. Call after `register_pending`, inside the write scope.
pub(crate) fn resolve_late_bound<S: Storage + ?Sized>(
    storage: &mut S,
    lookup: &RelationLookup,
) -> Result<Vec<(PendingRelation, RecordRef)>, EngineError> {
    let mut completed = Vec::new();
    for raw in lookup.slots.values().flatten() {
        let remote_id = RemoteId::parse(raw)?;
        let Some(target) = storage.resolve(&remote_id)? else {
            continue;
        };
        for relation in resolve_pending(storage, &remote_id, &target)? {
            completed.push((relation, target.clone()));
        }
    }
    Ok(completed)
}

/// Registers the unresolved targets of each relation field for `owner`.
pub(crate) fn register_pending<S: Storage + ?Sized>(
    storage: &mut S,
    kind: &EntityKind,
    owner: NativeId,
    lookup: &RelationLookup,
) -> Result<(), EngineError> {
    for (field, unresolved) in &lookup.slots {
        storage.set_slot(kind, field, owner, unresolved)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KindConfig;
    use remap_storage::{PersistenceEngine, RelationLedger, SqliteStorage};

    fn kind(s: &str) -> EntityKind {
        EntityKind::parse(s).unwrap()
    }

    fn rid(s: &str) -> RemoteId {
        RemoteId::parse(s).unwrap()
    }

    fn new_record(storage: &mut SqliteStorage, k: &EntityKind) -> NativeId {
        storage
            .apply_field_changes(
                k,
                WriteTarget::New {
                    location: StorageLocation::TOP_LEVEL,
                },
                &FieldMap::new(),
                &Context::default(),
            )
            .unwrap()
    }

    #[test]
    fn root_level_ignores_every_default() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let config = EngineConfig {
            default_location: Some(9),
            ..Default::default()
        }
        .with_kind("pages", KindConfig::root_level().with_default_location(4));

        let mut payload = FieldMap::new();
        payload.insert("pid".into(), FieldValue::Integer(12));
        let placement = resolve_location(&storage, &config, &kind("pages"), &mut payload).unwrap();

        assert_eq!(placement, Placement::At(StorageLocation::TOP_LEVEL));
        assert!(!payload.contains_key("pid"));
    }

    #[test]
    fn location_precedence() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let config = EngineConfig {
            default_location: Some(9),
            ..Default::default()
        }
        .with_kind("content", KindConfig::default().with_default_location(4));
        let content = kind("content");

        let mut payload = FieldMap::new();
        assert_eq!(
            resolve_location(&storage, &config, &content, &mut payload).unwrap(),
            Placement::At(StorageLocation::new(4).unwrap())
        );
        assert_eq!(
            resolve_location(&storage, &config, &kind("other"), &mut payload).unwrap(),
            Placement::At(StorageLocation::new(9).unwrap())
        );

        payload.insert("pid".into(), FieldValue::Text("folder-1".into()));
        assert_eq!(
            resolve_location(&storage, &config, &content, &mut payload).unwrap(),
            Placement::WaitingOn(rid("folder-1"))
        );

        let folder = new_record(&mut storage, &kind("pages"));
        storage.bind(&rid("folder-1"), &kind("pages"), folder).unwrap();
        payload.insert("pid".into(), FieldValue::Text("folder-1".into()));
        assert_eq!(
            resolve_location(&storage, &config, &content, &mut payload).unwrap(),
            Placement::At(folder.into())
        );
    }

    #[test]
    fn unresolved_targets_split_out() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let config =
            EngineConfig::default().with_kind("content", KindConfig::default().with_relations(&["links"]));
        let target = new_record(&mut storage, &kind("content"));
        storage.bind(&rid("A"), &kind("content"), target).unwrap();

        let mut payload = FieldMap::new();
        payload.insert("links".into(), FieldValue::Text("A, B, ,A".into()));
        let lookup = resolve_relations(&storage, &config, &kind("content"), &mut payload).unwrap();

        assert_eq!(
            payload.get("links"),
            Some(&FieldValue::Refs(vec![RecordRef::new(kind("content"), target)]))
        );
        assert_eq!(lookup.slots.get("links"), Some(&vec!["B".to_string()]));
    }

    #[test]
    fn non_id_relation_value_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let config =
            EngineConfig::default().with_kind("content", KindConfig::default().with_relations(&["links"]));
        let mut payload = FieldMap::new();
        payload.insert("links".into(), FieldValue::Integer(3));
        assert!(matches!(
            resolve_relations(&storage, &config, &kind("content"), &mut payload),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn pending_patch_appends_and_skips_deleted_owners() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let k = kind("content");
        let live = new_record(&mut storage, &k);
        let gone = new_record(&mut storage, &k);
        let existing = new_record(&mut storage, &k);
        let target = new_record(&mut storage, &k);

        let mut change = FieldMap::new();
        change.insert(
            "links".into(),
            FieldValue::Refs(vec![RecordRef::new(k.clone(), existing)]),
        );
        storage
            .apply_field_changes(&k, WriteTarget::Existing(live), &change, &Context::default())
            .unwrap();

        storage.set_slot(&k, "links", live, &["B-42".to_string()]).unwrap();
        storage.set_slot(&k, "links", gone, &["B-42".to_string()]).unwrap();
        storage.delete_record(&k, gone).unwrap();

        let target_ref = RecordRef::new(k.clone(), target);
        let patched = resolve_pending(&mut storage, &rid("B-42"), &target_ref).unwrap();

        assert_eq!(patched.len(), 1);
        assert_eq!(patched[0].owner, live);
        assert_eq!(
            storage.fetch_field(&k, live, "links").unwrap(),
            Some(FieldValue::Refs(vec![
                RecordRef::new(k.clone(), existing),
                target_ref,
            ]))
        );
        assert_eq!(storage.pending_count().unwrap(), 0);
    }

    #[test]
    fn pending_patch_drops_refs_to_deleted_records() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let k = kind("content");
        let owner = new_record(&mut storage, &k);
        let stale = new_record(&mut storage, &k);
        let target = new_record(&mut storage, &k);

        let mut change = FieldMap::new();
        change.insert("links".into(), FieldValue::Refs(vec![RecordRef::new(k.clone(), stale)]));
        storage
            .apply_field_changes(&k, WriteTarget::Existing(owner), &change, &Context::default())
            .unwrap();
        storage.set_slot(&k, "links", owner, &["B".to_string()]).unwrap();
        storage.delete_record(&k, stale).unwrap();

        let target_ref = RecordRef::new(k.clone(), target);
        let patched = resolve_pending(&mut storage, &rid("B"), &target_ref).unwrap();

        assert_eq!(patched.len(), 1);
        assert_eq!(
            storage.fetch_field(&k, owner, "links").unwrap(),
            Some(FieldValue::Refs(vec![target_ref]))
        );
    }

    #[test]
    fn late_bound_targets_complete_registered_slots() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let k = kind("content");
        let owner = new_record(&mut storage, &k);
        let target = new_record(&mut storage, &k);

        let mut lookup = RelationLookup::default();
        lookup.slots.insert("links".into(), vec!["B".into(), "C".into()]);
        register_pending(&mut storage, &k, owner, &lookup).unwrap();
        storage.bind(&rid("B"), &k, target).unwrap();

        let completed = resolve_late_bound(&mut storage, &lookup).unwrap();

        let target_ref = RecordRef::new(k.clone(), target);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1, target_ref);
        assert_eq!(
            storage.fetch_field(&k, owner, "links").unwrap(),
            Some(FieldValue::Refs(vec![target_ref]))
        );
        let left: Vec<RemoteId> = storage
            .find_by_slot(&k, "links", owner)
            .unwrap()
            .into_iter()
            .map(|p| p.target)
            .collect();
        assert_eq!(left, vec![rid("C")]);
    }
}
