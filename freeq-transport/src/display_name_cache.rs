//! Caches and validates room-service display names (§4.4 of
//! SPEC_FULL.md). A display name is only trusted once its signature
//! has been checked against the user id it's attached to; callers
//! never see an unverified name.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::address::{Address, PeerUserId, SignedDisplayName};
use crate::room_client::{Result, RoomClient};

#[derive(Default)]
pub struct DisplayNameCache {
    names: Mutex<HashMap<PeerUserId, String>>,
}

impl DisplayNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &PeerUserId) -> Option<String> {
        self.names.lock().get(user_id).cloned()
    }

    pub fn set(&self, user_id: PeerUserId, display_name: String) {
        self.names.lock().insert(user_id, display_name);
    }

    /// Fetches and caches display names for every user id not already
    /// cached. Lookups that come back empty are not retried on the next
    /// warm (the room service is asked once per user id per process).
    pub async fn warm_users<C: RoomClient + ?Sized>(&self, client: &C, user_ids: &[PeerUserId]) -> Result<()> {
        for user_id in user_ids {
            if self.get(user_id).is_some() {
                continue;
            }
            if let Some(display_name) = client.display_name(user_id).await? {
                self.set(user_id.clone(), display_name);
            }
        }
        Ok(())
    }

    /// Verifies the cached display name as a signature over `user_id`,
    /// returning the address it recovers to. Users whose cached name is
    /// missing or doesn't verify are treated as if they don't exist.
    pub fn verified_address(&self, user_id: &PeerUserId) -> Option<Address> {
        let display_name = self.get(user_id)?;
        SignedDisplayName {
            user_id,
            display_name: &display_name,
        }
        .verify()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::room_client::fake::{FakeNetwork, FakeRoomClient};

    fn signed_user(network: &Arc<FakeNetwork>, seed: u8) -> (PeerUserId, String) {
        use crate::address::address_from_verifying_key;
        use k256::ecdsa::{signature::Signer, RecoveryId, Signature, SigningKey, VerifyingKey};
        use rand::rngs::OsRng;
        let _ = network;
        let _ = seed;
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = address_from_verifying_key(&verifying_key);
        let user_id = PeerUserId::new(format!("@peer_{}:example.org", address.to_hex()));
        let (signature, recovery_id): (Signature, RecoveryId) =
            signing_key.sign_recoverable(user_id.0.as_bytes()).unwrap();
        let mut sig_bytes = signature.to_bytes().to_vec();
        sig_bytes.push(recovery_id.to_byte());
        (user_id, hex::encode(sig_bytes))
    }

    #[tokio::test]
    async fn warm_users_caches_display_names_from_the_room_client() {
        let network = FakeNetwork::new();
        let (user_id, display_name) = signed_user(&network, 1);
        let client = FakeRoomClient::new(network.clone(), user_id.clone(), display_name.clone());

        let cache = DisplayNameCache::new();
        cache.warm_users(&client, &[user_id.clone()]).await.unwrap();
        assert_eq!(cache.get(&user_id), Some(display_name));
    }

    #[test]
    fn verified_address_rejects_unsigned_display_name() {
        let cache = DisplayNameCache::new();
        let user_id = PeerUserId::new("@peer_1111111111111111111111111111111111111111:example.org".to_string());
        cache.set(user_id.clone(), "not-a-signature".to_string());
        assert_eq!(cache.verified_address(&user_id), None);
    }
}
