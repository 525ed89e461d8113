//! Command implementations for the peermesh CLI.

use anyhow::{bail, Context, Result};
use peermesh_core::crypto::Identity;
use peermesh_core::events::{MessageEvent, StatusEvent};
use peermesh_core::manager::{CoreManager, ManagerConfig};
use peermesh_core::storage::{AppStore, MemoryStore, PersistedIdentity, SqliteStore};
use peermesh_core::transport::MemoryHub;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn open_store(data_dir: &str) -> Result<AppStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("cannot create data dir {data_dir}"))?;
    let db_path = Path::new(data_dir).join("peermesh.db");
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("cannot open {}", db_path.display()))?;
    Ok(AppStore::new(Arc::new(store)))
}

/// Create (or overwrite) the local identity.
pub fn init(data_dir: &str, force: bool) -> Result<()> {
    let store = open_store(data_dir)?;
    if store.identity()?.is_some() && !force {
        bail!("identity already exists; use --force to overwrite");
    }
    let identity = Identity::generate();
    use base64::Engine as _;
    store.save_identity(&PersistedIdentity {
        secret_b64: base64::engine::general_purpose::STANDARD
            .encode(identity.secret_bytes().as_slice()),
        public_b64: identity.public_key_b64().to_string(),
    })?;
    println!("created identity {}", identity.fingerprint());
    Ok(())
}

/// Show the local identity.
pub fn identity(data_dir: &str) -> Result<()> {
    let store = open_store(data_dir)?;
    let identity = match store.identity_secret()? {
        Some(secret) => Identity::from_secret_bytes(&secret)?,
        None => {
            let identity = Identity::generate();
            use base64::Engine as _;
            store.save_identity(&PersistedIdentity {
                secret_b64: base64::engine::general_purpose::STANDARD
                    .encode(identity.secret_bytes().as_slice()),
                public_b64: identity.public_key_b64().to_string(),
            })?;
            identity
        }
    };
    println!("fingerprint: {}", identity.fingerprint());
    println!("public key:  {}", identity.public_key_b64());
    Ok(())
}

/// List saved contacts.
pub fn contacts(data_dir: &str) -> Result<()> {
    let store = open_store(data_dir)?;
    let contacts = store.contacts()?;
    if contacts.is_empty() {
        println!("no contacts");
        return Ok(());
    }
    for (fp, contact) in contacts {
        println!(
            "{fp}  {}  {}",
            contact.name,
            contact.current_address.as_deref().unwrap_or("offline")
        );
    }
    Ok(())
}

/// List saved groups.
pub fn groups(data_dir: &str) -> Result<()> {
    let store = open_store(data_dir)?;
    let groups = store.groups()?;
    if groups.is_empty() {
        println!("no groups");
        return Ok(());
    }
    for group in groups {
        println!(
            "{}  {}  ({} members)",
            group.group_id,
            group.name,
            group.member_count()
        );
    }
    Ok(())
}

/// Spin up several in-process nodes on a shared hub and walk them through
/// discovery, a handshake, and an encrypted message.
pub async fn demo(peers: usize) -> Result<()> {
    if peers < 2 {
        bail!("the demo needs at least 2 peers");
    }
    let hub = MemoryHub::new();
    let mut handles = Vec::new();

    for index in 0..peers {
        let mut config = ManagerConfig::new(format!("peer-{index}"));
        config.public_ip = Some("198.51.100.7".to_string());
        let store = AppStore::new(Arc::new(MemoryStore::new()));
        let handle = CoreManager::start(
            config,
            store,
            Arc::new(hub.transport()),
            hub.clone() as Arc<dyn peermesh_core::transport::Reachability>,
        )
        .await?;
        info!(
            peer = index,
            fp = handle.fingerprint(),
            addr = handle.address(),
            "node started"
        );
        handles.push(handle);
    }

    // Let the same-IP namespace elect a router and spread the registry.
    tokio::time::sleep(Duration::from_secs(12)).await;

    // Handshake between the first two peers, then one encrypted message.
    let mut b_status = handles[1].bus().subscribe_status();
    let mut b_messages = handles[1].bus().subscribe_message();

    handles[0].add_contact(handles[1].address(), Some("peer-1".into()))?;

    let a_fp = handles[0].fingerprint().to_string();
    let accepted = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(StatusEvent::ContactOnline { fingerprint }) = b_status.recv().await {
                if fingerprint == a_fp {
                    return fingerprint;
                }
            }
        }
    })
    .await
    .context("peer-1 never saw the contact request")?;
    handles[1].accept_contact(&accepted)?;

    // Wait until the requester holds the fingerprint-keyed record.
    let b_fp = handles[1].fingerprint().to_string();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let contacts = handles[0].contacts().await.unwrap_or_default();
            if contacts.iter().any(|c| c.fingerprint == b_fp) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .context("handshake did not complete")?;

    let id = handles[0].send_text(&b_fp, "hello from peer-0").await?;
    info!(message = %id, "sent");

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(MessageEvent::Received { message, .. }) = b_messages.recv().await {
                println!("peer-1 received: {:?}", message.content);
                return;
            }
        }
    })
    .await
    .context("message never arrived")?;

    for handle in &handles {
        handle.shutdown();
    }
    println!("demo complete: {peers} peers, one router, one encrypted message");
    Ok(())
}
