//! End-to-end overlay scenarios: handshake, encrypted messaging,
//! rendezvous reconnection after both sides lose their addresses, and
//! group chat over an elected group router.

use peermesh_core::contact::MessageContent;
use peermesh_core::events::{GroupEvent, MessageEvent, StatusEvent};
use peermesh_core::manager::{CoreHandle, CoreManager, ManagerConfig};
use peermesh_core::namespace::Role;
use peermesh_core::storage::{AppStore, MemoryStore};
use peermesh_core::transport::{MemoryHub, Reachability};
use std::sync::Arc;
use std::time::Duration;

async fn start_node(
    hub: &Arc<MemoryHub>,
    store: &Arc<MemoryStore>,
    name: &str,
) -> CoreHandle {
    CoreManager::start(
        ManagerConfig::new(name),
        AppStore::new(Arc::clone(store) as Arc<dyn peermesh_core::storage::Store>),
        Arc::new(hub.transport()),
        Arc::clone(hub) as Arc<dyn Reachability>,
    )
    .await
    .expect("node starts")
}

/// Run the A→B handshake until both sides hold fingerprint-keyed records.
async fn handshake(a: &CoreHandle, b: &CoreHandle) {
    let mut b_status = b.bus().subscribe_status();
    a.add_contact(b.address(), Some("b".into())).expect("add");

    let a_fp = a.fingerprint().to_string();
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if let Ok(StatusEvent::ContactOnline { fingerprint }) = b_status.recv().await {
                if fingerprint == a_fp {
                    return;
                }
            }
        }
    })
    .await
    .expect("b saw the request");
    b.accept_contact(&a_fp).expect("accept");

    let b_fp = b.fingerprint().to_string();
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let contacts = a.contacts().await.unwrap_or_default();
            if contacts
                .iter()
                .any(|c| c.fingerprint == b_fp && c.public_key.is_some())
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("a learned b's key");
}

#[tokio::test(start_paused = true)]
async fn test_handshake_and_encrypted_message() {
    let hub = MemoryHub::new();
    let store_a = Arc::new(MemoryStore::new());
    let store_b = Arc::new(MemoryStore::new());
    let a = start_node(&hub, &store_a, "alice").await;
    let b = start_node(&hub, &store_b, "bob").await;

    handshake(&a, &b).await;

    let mut b_messages = b.bus().subscribe_message();
    let b_fp = b.fingerprint().to_string();
    let sent_id = a.send_text(&b_fp, "hello over the mesh").await.expect("send");

    let received = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if let Ok(MessageEvent::Received { message, .. }) = b_messages.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("message arrived");

    assert_eq!(received.id, sent_id);
    assert!(
        matches!(received.content, MessageContent::Text { ref body } if body == "hello over the mesh")
    );

    a.shutdown();
    b.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_rendezvous_reconnects_after_address_loss() {
    let hub = MemoryHub::new();
    let store_a = Arc::new(MemoryStore::new());
    let store_b = Arc::new(MemoryStore::new());

    // First session: become contacts, then everything shuts down.
    let (old_a_addr, old_b_addr, a_fp, b_fp) = {
        let a = start_node(&hub, &store_a, "alice").await;
        let b = start_node(&hub, &store_b, "bob").await;
        handshake(&a, &b).await;
        let result = (
            a.address().to_string(),
            b.address().to_string(),
            a.fingerprint().to_string(),
            b.fingerprint().to_string(),
        );
        a.shutdown();
        b.shutdown();
        tokio::time::sleep(Duration::from_secs(2)).await;
        result
    };

    // Second session: both come back under fresh transport addresses.
    // Neither knows the other's new address; only the rendezvous slug
    // (pairwise key + wall-clock window) can reunite them.
    let a = start_node(&hub, &store_a, "alice").await;
    let b = start_node(&hub, &store_b, "bob").await;
    assert_ne!(a.address(), old_a_addr);
    assert_ne!(b.address(), old_b_addr);

    let b_new_addr = b.address().to_string();
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let contacts = a.contacts().await.unwrap_or_default();
            if contacts
                .iter()
                .any(|c| c.fingerprint == b_fp && c.current_address.as_deref() == Some(b_new_addr.as_str()))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    })
    .await
    .expect("alice recovered bob's new address via rendezvous");

    // The fresh addresses carry real traffic again.
    let mut b_messages = b.bus().subscribe_message();
    a.send_text(&b_fp, "found you again").await.expect("send");
    let received = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Ok(MessageEvent::Received { fingerprint, message }) = b_messages.recv().await {
                if fingerprint == a_fp {
                    return message;
                }
            }
        }
    })
    .await
    .expect("post-rendezvous message arrived");
    assert!(matches!(received.content, MessageContent::Text { ref body } if body == "found you again"));

    a.shutdown();
    b.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_group_message_relayed_through_router() {
    let hub = MemoryHub::new();
    let store_a = Arc::new(MemoryStore::new());
    let store_b = Arc::new(MemoryStore::new());
    let a = start_node(&hub, &store_a, "alice").await;
    let b = start_node(&hub, &store_b, "bob").await;
    handshake(&a, &b).await;

    let mut a_status = a.bus().subscribe_status();
    let mut b_group = b.bus().subscribe_group();

    let group_id = a.create_group("the plan").await.expect("create group");

    // Wait until alice's group namespace settles (she claimed the router
    // id first, so she relays).
    let label = format!("group:{group_id}");
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(StatusEvent::Namespace { label: l, role, .. }) = a_status.recv().await {
                if l == label && role == Role::Router {
                    return;
                }
            }
        }
    })
    .await
    .expect("alice routes her group");

    let b_fp = b.fingerprint().to_string();
    a.group_invite(&group_id, &b_fp).await.expect("invite");

    // Bob joins via the invite and checks in at the router.
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(GroupEvent::Joined { info }) = b_group.recv().await {
                if info.group_id == group_id {
                    return;
                }
            }
        }
    })
    .await
    .expect("bob joined the group");

    // Wait until the router actually lists bob before sending.
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let groups = AppStore::new(Arc::clone(&store_a) as Arc<dyn peermesh_core::storage::Store>)
                .groups()
                .unwrap_or_default();
            if groups
                .iter()
                .any(|g| g.group_id == group_id && g.members.contains_key(&b_fp))
            {
                return;
            }
        }
    })
    .await
    .expect("router registered bob");

    a.group_send(&group_id, "meet at dawn").await.expect("send");

    let view = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(GroupEvent::MessageReceived { group_id: gid, message }) = b_group.recv().await
            {
                if gid == group_id {
                    return message;
                }
            }
        }
    })
    .await
    .expect("bob decrypted the group message");
    assert_eq!(view.text, "meet at dawn");

    a.shutdown();
    b.shutdown();
}
