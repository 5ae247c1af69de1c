//! Netlink link watcher: the Linux source of interface events.
//!
//! Dumps the link table over rtnetlink and synthesizes the added / removed
//! / status-changed events the control plane's event bus expects.

use std::{io, time::Duration};

use futures::TryStreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkFlag};
use rustc_hash::FxHashMap;
use tetherd_core::EventBus;
use tracing::{debug, warn};

/// One link from a netlink dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub name: String,
    pub up: bool,
}

/// Dumps all links currently known to the kernel.
pub async fn list_links() -> io::Result<Vec<LinkSnapshot>> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);

    let mut links = handle.link().get().execute();
    let mut out = Vec::new();

    while let Some(msg) = links.try_next().await.map_err(io::Error::other)? {
        let up = msg.header.flags.contains(&LinkFlag::Up);
        for attr in msg.attributes {
            if let LinkAttribute::IfName(name) = attr {
                out.push(LinkSnapshot { name, up });
                break;
            }
        }
    }

    Ok(out)
}

/// Diffs two link dumps into bus events. Exposed for the poller; the order
/// is adds (with an immediate up status), then status flips, then removes.
pub(crate) fn diff_links(
    known: &mut FxHashMap<String, bool>,
    current: Vec<LinkSnapshot>,
    bus: &EventBus,
) {
    let mut seen: Vec<String> = Vec::with_capacity(current.len());

    for link in &current {
        seen.push(link.name.clone());
        match known.get(&link.name) {
            None => {
                debug!(iface = %link.name, up = link.up, "new link");
                bus.interface_added(&link.name);
                if link.up {
                    bus.interface_status_changed(&link.name, true);
                }
            }
            Some(prev_up) if *prev_up != link.up => {
                debug!(iface = %link.name, up = link.up, "link status changed");
                bus.interface_status_changed(&link.name, link.up);
            }
            Some(_) => {}
        }
    }

    for link in current {
        known.insert(link.name, link.up);
    }

    known.retain(|name, _| {
        if seen.iter().any(|s| s == name) {
            true
        } else {
            debug!(iface = %name, "link removed");
            bus.interface_removed(name);
            false
        }
    });
}

/// Spawns a task that polls the kernel link table and feeds interface
/// events into `bus`. Runs until aborted.
pub fn spawn_link_poller(bus: EventBus, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut known: FxHashMap<String, bool> = FxHashMap::default();
        let mut ticker = tokio::time::interval(period);

        loop {
            ticker.tick().await;
            match list_links().await {
                Ok(links) => diff_links(&mut known, links, &bus),
                Err(e) => warn!("link dump failed: {e}"),
            }
        }
    })
}
