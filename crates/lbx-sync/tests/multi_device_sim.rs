//! Property-based simulation of several devices editing one vault.
//!
//! Random edits, deletes, syncs and connectivity flips run against a shared
//! lbxd backend. Afterwards every device syncs until nothing moves, and:
//!
//! - every device holds exactly the server's item set, byte for byte
//! - no device is left with unpushed edits
//! - each device's last write to an item either reached the server or sits
//!   on that device's conflict shelf

mod common;

use std::collections::HashMap;

use common::{device, secret, sign_up, Backend, DirectRemote, PASSWORD};
use lbx_core::secret::{Meta, SecretValue, Text};
use lbx_storage::VaultStore;
use lbx_sync::{SyncOutcome, VaultClient};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

const EMAIL: &str = "sim@example.com";
const DEVICES: usize = 3;
const SLOTS: usize = 4;
const MAX_DRAIN_ROUNDS: usize = 20;

#[derive(Debug, Clone)]
enum SimOp {
    Put { device: usize, slot: usize },
    Delete { device: usize, slot: usize },
    Sync { device: usize },
    SetOffline { device: usize, offline: bool },
}

fn arb_op() -> impl Strategy<Value = SimOp> {
    prop_oneof![
        4 => (0..DEVICES, 0..SLOTS).prop_map(|(device, slot)| SimOp::Put { device, slot }),
        1 => (0..DEVICES, 0..SLOTS).prop_map(|(device, slot)| SimOp::Delete { device, slot }),
        3 => (0..DEVICES).prop_map(|device| SimOp::Sync { device }),
        1 => (0..DEVICES, any::<bool>()).prop_map(|(device, offline)| SimOp::SetOffline { device, offline }),
    ]
}

fn slot_id(slot: usize) -> String {
    format!("item-{slot}")
}

struct Device {
    client: VaultClient<DirectRemote>,
    remote: DirectRemote,
}

async fn setup(backend: &std::sync::Arc<Backend>) -> Vec<Device> {
    let mut devices = Vec::with_capacity(DEVICES);
    for n in 0..DEVICES {
        let remote = DirectRemote::new(backend.clone());
        let client = device(remote.clone());
        if n == 0 {
            sign_up(&client, backend, EMAIL).await;
        } else {
            client.login(EMAIL, secret(PASSWORD)).await.unwrap();
        }
        devices.push(Device { client, remote });
    }
    devices
}

async fn simulate(ops: Vec<SimOp>) -> Result<(), TestCaseError> {
    let backend = Backend::new();
    let devices = setup(&backend).await;

    // (device, id) -> ciphertext of that device's latest write
    let mut last_write: HashMap<(usize, String), Vec<u8>> = HashMap::new();
    let mut counter = 0u32;

    for op in ops {
        match op {
            SimOp::Put { device, slot } => {
                counter += 1;
                let id = slot_id(slot);
                let value = SecretValue::Text(Text {
                    meta: Meta::default(),
                    text: format!("device {device} write {counter}"),
                });
                let client = &devices[device].client;
                client.put_item(Some(&id), &id, &value).await.unwrap();
                let stored = client.engine().store().get_item(&id).unwrap().unwrap();
                last_write.insert((device, id), stored.value);
            }
            SimOp::Delete { device, slot } => {
                let id = slot_id(slot);
                if devices[device].client.delete_item(&id).await.is_ok() {
                    last_write.remove(&(device, id));
                }
            }
            SimOp::Sync { device } => {
                let report = devices[device].client.sync().await.unwrap();
                prop_assert_ne!(report.outcome, SyncOutcome::NeedsLogin);
            }
            SimOp::SetOffline { device, offline } => devices[device].remote.set_offline(offline),
        }
    }

    for d in &devices {
        d.remote.set_offline(false);
    }
    let mut quiet = false;
    for _ in 0..MAX_DRAIN_ROUNDS {
        quiet = true;
        for d in &devices {
            let report = d.client.sync().await.unwrap();
            if report.pulled > 0 || report.pushed > 0 || report.outcome != SyncOutcome::Completed {
                quiet = false;
            }
        }
        if quiet {
            break;
        }
    }
    prop_assert!(quiet, "devices still exchanging after {} rounds", MAX_DRAIN_ROUNDS);

    let mut server = backend.vault.list_vault_items(EMAIL, None).unwrap();
    server.sort_by(|a, b| a.id.cmp(&b.id));
    for (n, d) in devices.iter().enumerate() {
        let store = d.client.engine().store();
        prop_assert!(store.list_dirty().unwrap().is_empty(), "device {} has unpushed edits", n);

        let mut local = store.list_items().unwrap();
        local.sort_by(|a, b| a.id.cmp(&b.id));
        prop_assert_eq!(&local, &server, "device {} diverged", n);

        for item in local.iter().filter(|i| !i.is_deleted) {
            prop_assert!(d.client.get_item(&item.id).is_ok(), "device {} cannot open {}", n, item.id);
        }
    }

    for ((n, id), value) in &last_write {
        let shelved = devices[*n]
            .client
            .engine()
            .store()
            .list_conflicts()
            .unwrap()
            .iter()
            .any(|c| &c.id == id && &c.value == value);
        prop_assert!(
            backend.was_accepted(id, value) || shelved,
            "device {} lost its write to {}",
            n,
            id
        );
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn devices_converge_without_losing_writes(ops in prop::collection::vec(arb_op(), 1..60)) {
        tokio_test::block_on(simulate(ops))?;
    }
}

#[tokio::test]
async fn test_three_way_race_on_one_item() {
    let backend = Backend::new();
    let devices = setup(&backend).await;
    let note = |t: &str| {
        SecretValue::Text(Text {
            meta: Meta::default(),
            text: t.into(),
        })
    };

    for (n, d) in devices.iter().enumerate() {
        d.client.put_item(Some("shared"), "shared", &note(&format!("from {n}"))).await.unwrap();
    }
    for d in &devices {
        d.client.sync().await.unwrap();
    }
    for d in &devices {
        d.client.sync().await.unwrap();
    }

    // The first write landed at once; the other two were shelved on pull.
    for d in &devices {
        assert_eq!(d.client.get_item("shared").unwrap().value, note("from 0"));
    }
    assert!(devices[0].client.list_conflicts().unwrap().is_empty());
    for d in &devices[1..] {
        assert_eq!(d.client.list_conflicts().unwrap().len(), 1);
    }
}
