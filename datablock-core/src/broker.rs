//! The interface the core calls into for discovery, not an implementation
//! of it. Spec §6.2: the broker is an external collaborator — wire format,
//! transport, and auth (ZMQ, JSON, CurveZMQ) are all out of scope here. This
//! module only fixes the shape of the calls so a real broker client can be
//! dropped in without touching `Producer`/`Consumer`.

/// What a producer hands the broker when it registers a channel, and what a
/// consumer gets back from [`Messenger::discover_producer`].
#[derive(Debug, Clone)]
pub struct ProducerAnnouncement {
    pub shm_name: String,
    pub flexzone_schema_hash: [u8; 32],
    pub datablock_schema_hash: [u8; 32],
    pub schema_version: u32,
    pub producer_pid: u64,
}

/// Discovery-only broker contract. Bulk data never flows through a
/// `Messenger`; it only ever hands out the shared-memory name and the schema
/// hashes a consumer needs to validate before attaching.
///
/// Every method is synchronous and best-effort: a `Messenger` that can't
/// reach its transport should return `None`/fail silently per-call rather
/// than panic, matching the spec's "fire-and-forget" framing for
/// registration and the "best-effort" framing for deregistration and
/// heartbeats.
pub trait Messenger: Send + Sync {
    /// Announce a producer on `channel`. Fire-and-forget: the broker is
    /// expected to store this metadata and serve it to consumers calling
    /// `discover_producer`, but a `Messenger` implementation is free to drop
    /// the call if its transport is unavailable.
    fn register_producer(&self, channel: &str, announcement: &ProducerAnnouncement);

    /// Look up the current producer for `channel`, waiting up to `timeout`.
    fn discover_producer(
        &self,
        channel: &str,
        timeout: std::time::Duration,
    ) -> Option<ProducerAnnouncement>;

    /// Best-effort deregistration, e.g. as part of a clean producer
    /// shutdown. Not required for correctness: an unreachable broker simply
    /// keeps serving stale discovery results until its own channel-expiry
    /// policy (if any) catches up.
    fn deregister_producer(&self, channel: &str, pid: u64);

    /// Optional liveness ping the broker can use to expire channels whose
    /// producer has stopped heartbeating. No-op for a `Messenger` that
    /// doesn't implement channel expiry.
    fn heartbeat(&self, channel: &str, pid: u64);
}

/// A `Messenger` that does nothing: every registration/heartbeat call is
/// dropped and every discovery attempt returns `None`. Used by tests and by
/// any caller that attaches directly by `shm_name` without broker-mediated
/// discovery — the core never requires a broker to function, only to be
/// found.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMessenger;

impl Messenger for NullMessenger {
    fn register_producer(&self, _channel: &str, _announcement: &ProducerAnnouncement) {}

    fn discover_producer(
        &self,
        _channel: &str,
        _timeout: std::time::Duration,
    ) -> Option<ProducerAnnouncement> {
        None
    }

    fn deregister_producer(&self, _channel: &str, _pid: u64) {}

    fn heartbeat(&self, _channel: &str, _pid: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_messenger_never_discovers_anything() {
        let messenger = NullMessenger;
        assert!(messenger
            .discover_producer("chan", std::time::Duration::from_millis(1))
            .is_none());
        messenger.register_producer(
            "chan",
            &ProducerAnnouncement {
                shm_name: "x".into(),
                flexzone_schema_hash: [0; 32],
                datablock_schema_hash: [0; 32],
                schema_version: 1,
                producer_pid: 1,
            },
        );
        messenger.heartbeat("chan", 1);
        messenger.deregister_producer("chan", 1);
    }
}
