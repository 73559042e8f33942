mod support;

use mdm_rs::model::{AssertionKind, MDM_RESTRICTED_TAG, MDM_TYPE_TAG};
use mdm_rs::{
    Bundle, CancelToken, MdmError, MdmView, Principal, Record, RecordKey, RecordQuery,
    RecordRepository,
};
use support::{clerk, date, harness, patient, system};

#[test]
fn master_view_queries_return_projections_only() {
    let h = harness();
    let one = h.insert(patient("1", "Ann Lee", date(1980, 1, 1)));
    h.insert(patient("2", "Ann Lee", date(1980, 1, 1)));
    h.insert(patient("3", "Bob Ray", date(1990, 1, 1)));

    let masters = h
        .repository
        .query(RecordQuery::new("Patient"), &clerk())
        .unwrap();
    assert_eq!(masters.len(), 2);
    assert!(masters.iter().all(Record::is_master));
    let ann = masters
        .iter()
        .find(|master| master.key == h.master_of(one.key))
        .unwrap();
    assert_eq!(ann.identifiers.len(), 2);

    let locals = h
        .repository
        .query(RecordQuery::new("Patient").with_view(MdmView::Local), &clerk())
        .unwrap();
    assert_eq!(locals.len(), 3);
    assert!(locals.iter().all(Record::is_local));
}

#[test]
fn identifier_queries_find_masters_through_their_locals() {
    let h = harness();
    let ann = h.insert(patient("100", "Ann Lee", date(1980, 1, 1)));
    h.insert(patient("200", "Bob Ray", date(1990, 1, 1)));
    let master = h.master_of(ann.key);

    let masters = h
        .repository
        .query(
            RecordQuery::new("Patient").with_identifier("MRN", "100"),
            &clerk(),
        )
        .unwrap();
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].key, master);
    assert!(masters[0].is_master());

    let locals = h
        .repository
        .query(
            RecordQuery::new("Patient")
                .with_identifier("MRN", "100")
                .with_view(MdmView::Local),
            &clerk(),
        )
        .unwrap();
    assert_eq!(locals.len(), 1);
    assert_eq!(locals[0].key, ann.key);

    let shell = h
        .repository
        .fetch(master)
        .unwrap()
        .with_identifier("EMPI", "E-9");
    h.repository.update(shell, &system()).unwrap();
    h.settle();
    let by_empi = h
        .repository
        .query(
            RecordQuery::new("Patient").with_identifier("EMPI", "E-9"),
            &clerk(),
        )
        .unwrap();
    assert_eq!(by_empi.len(), 1);
    assert_eq!(by_empi[0].key, master);
}

#[test]
fn reading_a_local_in_master_view_serves_its_master() {
    let h = harness();
    let local = h.insert(patient("1", "Ann Lee", date(1980, 1, 1)));
    let master = h.master_of(local.key);

    let served = h
        .repository
        .get(local.key, MdmView::Master, &clerk())
        .unwrap()
        .unwrap();
    assert_eq!(served.key, master);
    assert!(served.is_master());
    assert_eq!(served.identifiers, local.identifiers);

    let raw = h
        .repository
        .get(local.key, MdmView::Local, &clerk())
        .unwrap()
        .unwrap();
    assert_eq!(raw.key, local.key);
    assert!(raw.is_local());
}

#[test]
fn restricted_local_is_redacted_for_unauthorized_readers() {
    let h = harness();
    let vip = h.insert(
        patient("42", "Famous Person", date(1960, 6, 6)).with_tag(MDM_RESTRICTED_TAG, "vip"),
    );
    let master = h.master_of(vip.key);

    let seen_by_clerk = h
        .repository
        .get(vip.key, MdmView::Local, &clerk())
        .unwrap()
        .unwrap();
    assert_eq!(seen_by_clerk.identifiers, vip.identifiers);
    assert!(seen_by_clerk.names.is_empty());
    assert!(seen_by_clerk.birth_date.is_none());

    let cleared = Principal::new("doctor").with_policy("vip");
    let seen_by_doctor = h
        .repository
        .get(vip.key, MdmView::Local, &cleared)
        .unwrap()
        .unwrap();
    assert_eq!(seen_by_doctor.names, vip.names);

    let projected = h.service.project(master, &clerk()).unwrap();
    assert_eq!(projected.identifiers, vip.identifiers);
    assert!(projected.names.is_empty());
    let projected = h.service.project(master, &cleared).unwrap();
    assert_eq!(projected.names, vip.names);
}

#[test]
fn restricted_local_still_feeds_matching() {
    let h = harness();
    let vip = h.insert(
        patient("42", "Famous Person", date(1960, 6, 6)).with_tag(MDM_RESTRICTED_TAG, "vip"),
    );
    let other = h.insert(patient("43", "Famous Person", date(1960, 6, 6)));
    assert_eq!(h.master_of(other.key), h.master_of(vip.key));
}

#[test]
fn untagged_inserts_become_locals() {
    let h = harness();
    let stored = h.insert(patient("1", "Ann Lee", date(1980, 1, 1)));
    assert_eq!(stored.tag(MDM_TYPE_TAG), Some("L"));

    let invalid = h.repository.insert(
        patient("2", "Bob Ray", date(1990, 1, 1)).with_tag(MDM_TYPE_TAG, "X"),
        &clerk(),
    );
    assert!(matches!(invalid, Err(MdmError::InvalidOperation(_))));
}

#[test]
fn mdm_managed_writes_need_the_system_policy() {
    let h = harness();
    let local = h.insert(patient("1", "Ann Lee", date(1980, 1, 1)));
    let master = h.master_of(local.key);

    let forged = h.repository.insert(
        patient("2", "Bob Ray", date(1990, 1, 1)).with_tag(MDM_TYPE_TAG, "M"),
        &clerk(),
    );
    assert!(matches!(forged, Err(MdmError::Permission(_))));

    let flipped = h
        .repository
        .fetch(local.key)
        .unwrap()
        .with_tag(MDM_TYPE_TAG, "M");
    assert!(matches!(
        h.repository.update(flipped, &clerk()),
        Err(MdmError::Permission(_))
    ));

    assert!(matches!(
        h.repository.obsolete(master, &clerk()),
        Err(MdmError::Permission(_))
    ));

    let asserted = h.repository.insert(
        patient("3", "Cy Vance", date(1970, 1, 1))
            .with_assertion(AssertionKind::MasterRecord, master),
        &clerk(),
    );
    assert!(matches!(asserted, Err(MdmError::Permission(_))));

    assert!(!h.repository.fetch(master).unwrap().obsoleted);
    assert!(h.repository.fetch(local.key).unwrap().is_local());
    assert_eq!(h.repository.scan(&"Patient".into()).len(), 2);
}

#[test]
fn system_principal_may_edit_masters() {
    let h = harness();
    let local = h.insert(patient("1", "Ann Lee", date(1980, 1, 1)));
    let master = h.master_of(local.key);

    let shell = h
        .repository
        .fetch(master)
        .unwrap()
        .with_identifier("EMPI", "E-1");
    h.repository.update(shell, &system()).unwrap();
    h.settle();

    let projected = h.service.project(master, &clerk()).unwrap();
    assert!(projected
        .identifiers
        .iter()
        .any(|id| id.domain == "EMPI" && id.value == "E-1"));
}

#[test]
fn bundles_cannot_be_queried() {
    let h = harness();
    assert!(matches!(
        h.repository.query(RecordQuery::new("Bundle"), &clerk()),
        Err(MdmError::NotSupported(_))
    ));
}

#[test]
fn committed_bundle_entries_are_resolved_in_order() {
    let h = harness();
    let bundle = Bundle::new()
        .with_entry(patient("1", "Ann Lee", date(1980, 1, 1)))
        .with_entry(patient("2", "Ann Lee", date(1980, 1, 1)));

    let committed = h
        .service
        .submit_bundle(bundle, &clerk(), &CancelToken::new())
        .unwrap();
    h.settle();

    let masters: Vec<RecordKey> = committed.iter().map(|r| h.master_of(r.key)).collect();
    assert_eq!(masters[0], masters[1]);
    h.assert_invariant();
}

#[test]
fn rejected_bundle_leaves_no_trace() {
    let h = harness();
    let before = h.service.worker_stats().completed;
    let bundle = Bundle::new()
        .with_entry(patient("1", "Ann Lee", date(1980, 1, 1)))
        .with_entry(patient("2", "Bob Ray", date(1990, 1, 1)).with_tag(MDM_TYPE_TAG, "M"));

    assert!(matches!(
        h.service.submit_bundle(bundle, &clerk(), &CancelToken::new()),
        Err(MdmError::Permission(_))
    ));
    h.settle();
    assert!(h.repository.is_empty());
    assert_eq!(h.service.worker_stats().completed, before);
}

#[test]
fn shutdown_releases_subscriptions() {
    let h = harness();
    h.insert(patient("1", "Ann Lee", date(1980, 1, 1)));
    assert!(h.repository.subscriber_count(&"Patient".into()) > 0);

    assert!(h.service.shutdown());
    assert_eq!(h.repository.subscriber_count(&"Patient".into()), 0);
    // second call is a no-op
    assert!(h.service.shutdown());

    // writes after shutdown are plain repository writes
    let untouched = h
        .repository
        .insert(patient("2", "Bob Ray", date(1990, 1, 1)), &clerk())
        .unwrap();
    assert!(untouched.tag(MDM_TYPE_TAG).is_none());
}
