//! Leadership lifecycle: preparation, CA/TSK initialization, reloads, and
//! leadership loss mid-operation.

mod common;

use std::time::Duration;

use common::{new_master, MASTER_UUID};
use lode_master::catalog::{CreateTableRequest, GetTableLocationsRequest, ListTablesRequest, TableRef};
use lode_master::error::ErrorCode;
use lode_master::schema::{ColumnSchema, ColumnType, Schema};
use lode_master::tokens::{now_unix_secs, TokenSigningKey};

fn create_req(name: &str) -> CreateTableRequest {
    CreateTableRequest {
        name: name.to_string(),
        schema: Schema::new(
            vec![
                ColumnSchema::new("key", ColumnType::Int64),
                ColumnSchema::new("val", ColumnType::String),
            ],
            1,
        ),
        range_ops: Vec::new(),
        num_replicas: Some(3),
    }
}

#[tokio::test(start_paused = true)]
async fn preparation_initializes_ca_and_signing_keys() {
    let h = new_master(3).await;
    assert_eq!(h.catalog.leader_ready_term(), -1);

    h.become_leader(1).await;

    // CA material was generated, persisted, and only then adopted.
    let persisted = h.sys.ca().expect("CA record persisted");
    let adopted = h.ca.adopted_bundle().expect("CA adopted");
    assert_eq!(persisted, adopted);

    // The first token signing key is persisted and active.
    assert_eq!(h.sys.tsk_seqs(), vec![0]);
    assert!(h.signer.is_current_key_valid());
    assert_eq!(h.signer.current_key_seq(), Some(0));

    // A second election in the same term is a no-op.
    h.catalog.elected_as_leader();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.catalog.leader_ready_term(), 1);
    assert_eq!(h.ca.generated.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn generated_ca_material_is_discarded_when_persist_fails() {
    let h = new_master(3).await;

    // The CA write fails because leadership moved away mid-preparation.
    let consensus = h.consensus.clone();
    h.sys.fail_next_ca_add(move || {
        consensus.set_leader(2, Some("master-2"));
    });
    h.consensus.set_leader(1, Some(MASTER_UUID));
    h.catalog.elected_as_leader();

    // The preparation bails without installing anything.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.catalog.leader_ready_term(), -1);
    assert!(h.ca.adopted_bundle().is_none(), "unpersisted material is never adopted");
    assert!(h.sys.ca().is_none());

    // The next leadership generates fresh material and succeeds.
    h.become_leader(3).await;
    let persisted = h.sys.ca().expect("CA record persisted");
    assert_eq!(Some(persisted), h.ca.adopted_bundle());
}

#[tokio::test(start_paused = true)]
async fn expired_signing_keys_are_replaced_and_deleted() {
    let h = new_master(3).await;
    h.sys.insert_tsk(TokenSigningKey {
        seq_num: 0,
        expire_at_unix_secs: now_unix_secs() - 100,
        private_key_der: vec![1, 2, 3],
    });

    h.become_leader(1).await;

    // The expired key was deleted and a successor generated; sequence
    // numbering continues past the expired entry.
    assert_eq!(h.sys.tsk_seqs(), vec![1]);
    assert_eq!(h.signer.current_key_seq(), Some(1));
    assert!(h.signer.is_current_key_valid());
}

#[tokio::test(start_paused = true)]
async fn leadership_loss_during_alter_leaves_no_trace() {
    let h = new_master(3).await;
    h.become_leader(1).await;
    h.catalog.create_table(create_req("t")).await.expect("create table");
    h.wait_until("create RPCs", || h.all_create_requests().len() == 3).await;
    h.report_all_running(1, 1).await;

    let schema_before = h
        .catalog
        .get_table_schema(&TableRef::by_name("t"))
        .await
        .expect("schema before");

    h.sys.fail_next_write_not_leader();
    let err = h
        .catalog
        .alter_table(lode_master::catalog::AlterTableRequest {
            table: TableRef::by_name("t"),
            steps: Vec::new(),
            new_table_name: Some("t2".to_string()),
        })
        .await
        .expect_err("leadership lost mid-write");
    assert_eq!(err.code(), ErrorCode::NotTheLeader);

    // No rename is visible and the dirty state was discarded.
    let listed = h
        .catalog
        .list_tables(&ListTablesRequest::default())
        .await
        .expect("list tables");
    assert_eq!(listed.tables.len(), 1);
    assert_eq!(listed.tables[0].name, "t");

    let schema_after = h
        .catalog
        .get_table_schema(&TableRef::by_name("t"))
        .await
        .expect("schema after failed alter");
    assert_eq!(schema_after.schema, schema_before.schema);
    assert_eq!(schema_after.table_name, "t");

    // The same alter goes through once writes succeed again.
    h.catalog
        .alter_table(lode_master::catalog::AlterTableRequest {
            table: TableRef::by_name("t"),
            steps: Vec::new(),
            new_table_name: Some("t2".to_string()),
        })
        .await
        .expect("alter after recovery");
    let listed = h
        .catalog
        .list_tables(&ListTablesRequest::default())
        .await
        .expect("list tables");
    assert_eq!(listed.tables[0].name, "t2");
}

#[tokio::test(start_paused = true)]
async fn leadership_loss_during_create_leaves_no_trace() {
    let h = new_master(3).await;
    h.become_leader(1).await;

    h.sys.fail_next_write_not_leader();
    let err = h
        .catalog
        .create_table(create_req("t"))
        .await
        .expect_err("leadership lost mid-create");
    assert_eq!(err.code(), ErrorCode::NotTheLeader);

    let listed = h
        .catalog
        .list_tables(&ListTablesRequest::default())
        .await
        .expect("list tables");
    assert!(listed.tables.is_empty());
    assert!(h.sys.tablet_records().is_empty());

    // The name (and its reservation) are free again.
    h.catalog.create_table(create_req("t")).await.expect("create after recovery");
}

#[tokio::test(start_paused = true)]
async fn reelection_reloads_state_from_the_system_table() {
    let h = new_master(3).await;
    h.become_leader(1).await;
    h.catalog.create_table(create_req("a")).await.expect("create a");
    h.catalog.create_table(create_req("b")).await.expect("create b");
    h.wait_until("create RPCs", || h.all_create_requests().len() == 6).await;
    h.report_all_running(1, 1).await;

    // Leadership bounces to another master and back.
    h.consensus.set_leader(2, Some("master-2"));
    let err = h
        .catalog
        .list_tables(&ListTablesRequest::default())
        .await
        .expect_err("no longer the leader");
    assert_eq!(err.code(), ErrorCode::NotTheLeader);

    h.become_leader(3).await;

    let listed = h
        .catalog
        .list_tables(&ListTablesRequest::default())
        .await
        .expect("list after reload");
    let names: Vec<String> = listed.tables.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

    for name in ["a", "b"] {
        let locations = h
            .catalog
            .get_table_locations(&GetTableLocationsRequest::whole_table(TableRef::by_name(name)))
            .await
            .expect("locations after reload");
        assert_eq!(locations.tablet_locations.len(), 1);
        assert_eq!(locations.tablet_locations[0].replicas.len(), 3);
        let done = h
            .catalog
            .is_create_table_done(&TableRef::by_name(name))
            .await
            .expect("done after reload");
        assert!(done.done, "running state is restored from the system table");
    }

    // The CA is loaded, not regenerated, on re-election.
    assert_eq!(h.ca.generated.load(std::sync::atomic::Ordering::Relaxed), 1);
}
