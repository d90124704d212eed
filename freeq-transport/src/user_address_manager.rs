//! Tracks which room-service user ids belong to which node address, and
//! aggregates per-user presence into a per-address reachability signal
//! (§4.3 of SPEC_FULL.md).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{Address, PeerUserId};
use crate::room_client::Presence;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressReachability {
    /// At least one known user id for this address is online.
    Reachable,
    /// At least one presence is known, but none are online.
    Unreachable,
    /// No presence has ever been observed for this address.
    Unknown,
}

/// REACHABLE if any user id is online or unavailable (still connected,
/// just idle); UNREACHABLE only once every known user id has reported
/// definite offline presence; UNKNOWN if nothing has been observed yet
/// (§3 "Reachability").
fn aggregate(presences: impl Iterator<Item = Presence>) -> AddressReachability {
    let mut saw_any = false;
    let mut reachable = false;
    for presence in presences {
        saw_any = true;
        if matches!(presence, Presence::Online | Presence::Unavailable) {
            reachable = true;
        }
    }
    match (reachable, saw_any) {
        (true, _) => AddressReachability::Reachable,
        (false, true) => AddressReachability::Unreachable,
        (false, false) => AddressReachability::Unknown,
    }
}

#[derive(Default)]
struct State {
    address_to_userids: HashMap<Address, HashSet<PeerUserId>>,
    userid_to_address: HashMap<PeerUserId, Address>,
    userid_to_presence: HashMap<PeerUserId, Presence>,
    address_to_reachability: HashMap<Address, AddressReachability>,
}

/// Callbacks fired when aggregated state changes, mirroring the two
/// notifications the original source's address manager emits.
pub trait AddressManagerCallbacks: Send + Sync {
    fn on_address_reachability_changed(&self, address: Address, reachability: AddressReachability);
    fn on_user_presence_changed(&self, user_id: &PeerUserId, presence: Presence);
}

pub struct UserAddressManager {
    state: Mutex<State>,
    callbacks: Arc<dyn AddressManagerCallbacks>,
}

impl UserAddressManager {
    pub fn new(callbacks: Arc<dyn AddressManagerCallbacks>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            callbacks,
        }
    }

    /// Registers that `user_id` belongs to `address`. A single address
    /// may have more than one user id tracked at once (§9 Open Question:
    /// tolerated, not pruned).
    pub fn add_user_id(&self, address: Address, user_id: PeerUserId) {
        let mut state = self.state.lock();
        state.address_to_userids.entry(address).or_default().insert(user_id.clone());
        state.userid_to_address.insert(user_id, address);
    }

    pub fn get_userids_for_address(&self, address: &Address) -> Vec<PeerUserId> {
        self.state
            .lock()
            .address_to_userids
            .get(address)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_userid_presence(&self, user_id: &PeerUserId) -> Option<Presence> {
        self.state.lock().userid_to_presence.get(user_id).copied()
    }

    pub fn get_address_reachability(&self, address: &Address) -> AddressReachability {
        self.state
            .lock()
            .address_to_reachability
            .get(address)
            .copied()
            .unwrap_or(AddressReachability::Unknown)
    }

    /// Records a presence update for `user_id` and recomputes the
    /// reachability of its associated address, if known. Fires both
    /// callbacks on change, address reachability last so observers that
    /// react to it see the freshest per-user presence already recorded.
    pub fn update_presence(&self, user_id: &PeerUserId, presence: Presence) {
        let (address, reachability_changed, new_reachability, presence_changed) = {
            let mut state = self.state.lock();
            let presence_changed = state.userid_to_presence.get(user_id).copied() != Some(presence);
            state.userid_to_presence.insert(user_id.clone(), presence);

            let address = match state.userid_to_address.get(user_id).copied() {
                Some(address) => address,
                None => return,
            };
            let userids = state
                .address_to_userids
                .get(&address)
                .cloned()
                .unwrap_or_default();
            let new_reachability = aggregate(
                userids
                    .iter()
                    .filter_map(|uid| state.userid_to_presence.get(uid).copied()),
            );
            let previous = state.address_to_reachability.insert(address, new_reachability);
            (address, previous != Some(new_reachability), new_reachability, presence_changed)
        };

        if presence_changed {
            self.callbacks.on_user_presence_changed(user_id, presence);
        }
        if reachability_changed {
            self.callbacks.on_address_reachability_changed(address, new_reachability);
        }
    }
}
