use std::sync::Arc;

use tracing::info;

use crate::{
    error::{NetplayError, NetplayResult},
    persistence::PersistenceLock,
    prediction::{PredictionStrategy, RepeatLastConfirmed},
    sessions::config::{NetplayConfig, MAX_DELAY_FRAMES},
    sync_layer::SyncLayer,
    telemetry::ViolationObserver,
    Config, FrameStrategy, HandshakeInfo, NetplaySession, Role, Simulation, Transport,
    PROTOCOL_VERSION,
};

/// The [`SessionBuilder`] builds [`NetplaySession`]s.
///
/// After setting all appropriate values, use [`SessionBuilder::start_session`] to consume the
/// builder, perform the handshake and allocate the snapshot ring.
///
/// The authoritative side decides `delay_frames` and the [`FrameStrategy`]; the peer adopts
/// whatever the handshake announces, so those settings only matter on the authoritative side.
#[must_use = "SessionBuilder must be consumed by calling start_session"]
pub struct SessionBuilder<T>
where
    T: Config,
{
    role: Role,
    config: NetplayConfig,
    prediction: Box<dyn PredictionStrategy<T::Input>>,
    persistence: PersistenceLock,
    /// Optional observer for invariant violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> std::fmt::Debug for SessionBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            role,
            config,
            prediction: _,
            persistence,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("role", role)
            .field("config", config)
            .field("persistence", persistence)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// Construct a new builder with all values set to their defaults: authoritative role,
    /// [`NetplayConfig::default`], [`RepeatLastConfirmed`] prediction and a fresh
    /// [`PersistenceLock`].
    pub fn new() -> Self {
        Self {
            role: Role::default(),
            config: NetplayConfig::default(),
            prediction: Box::new(RepeatLastConfirmed),
            persistence: PersistenceLock::new(),
            violation_observer: None,
        }
    }

    /// Which side of the pairing this session plays.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Change the latency tolerance. The snapshot ring holds `2 * delay + 1` states.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if `delay` is 0 or larger than
    /// [`MAX_DELAY_FRAMES`].
    ///
    /// ```
    /// use delta_rollback::{Config, NetplayError, SessionBuilder};
    ///
    /// struct Cfg;
    /// impl Config for Cfg {
    ///     type Input = u8;
    /// }
    ///
    /// assert!(SessionBuilder::<Cfg>::new().with_delay_frames(8).is_ok());
    /// assert!(SessionBuilder::<Cfg>::new().with_delay_frames(0).is_err());
    /// # Ok::<(), NetplayError>(())
    /// ```
    pub fn with_delay_frames(mut self, delay: usize) -> NetplayResult<Self> {
        if delay == 0 || delay > MAX_DELAY_FRAMES {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "delay_frames must be between 1 and {}, got {}",
                    MAX_DELAY_FRAMES, delay
                ),
            });
        }
        self.config.delay_frames = delay;
        Ok(self)
    }

    /// Change the engine variant.
    pub fn with_strategy(mut self, strategy: FrameStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Replace the whole session configuration. Validated in
    /// [`start_session`](Self::start_session).
    pub fn with_config(mut self, config: NetplayConfig) -> Self {
        self.config = config;
        self
    }

    /// Change how remote input is guessed before it arrives. Both sides should use the same
    /// strategy only if they want identical predicted frames; correctness never depends on it.
    pub fn with_prediction_strategy<P>(mut self, strategy: P) -> Self
    where
        P: PredictionStrategy<T::Input> + 'static,
    {
        self.prediction = Box::new(strategy);
        self
    }

    /// Share a lock with a persistence task so it never observes the simulation mid-step.
    pub fn with_persistence_lock(mut self, lock: PersistenceLock) -> Self {
        self.persistence = lock;
        self
    }

    /// Sets a custom observer for invariant violations.
    ///
    /// Without one, violations are logged through `tracing`.
    ///
    /// ```
    /// use delta_rollback::{Config, SessionBuilder};
    /// use delta_rollback::telemetry::CollectingObserver;
    /// use std::sync::Arc;
    ///
    /// struct Cfg;
    /// impl Config for Cfg {
    ///     type Input = u8;
    /// }
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::<Cfg>::new().with_violation_observer(observer.clone());
    /// assert!(observer.is_empty());
    /// # drop(builder);
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Consumes the builder, performs the handshake over `transport` and allocates the
    /// snapshot ring.
    ///
    /// The authoritative side announces its configuration and the size of `sim`'s state. The
    /// peer receives the announcement, checks it against its own simulation and adopts the
    /// announced delay and strategy.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] if the configuration is invalid.
    /// - [`NetplayError::HandshakeFailed`] if the protocol versions or state sizes differ, or
    ///   the handshake announces an invalid configuration.
    /// - Any error returned by the transport during the handshake.
    /// - [`NetplayError::AllocationFailed`] if the ring cannot be allocated.
    pub fn start_session<S>(
        self,
        mut transport: Box<dyn Transport<T>>,
        sim: &S,
    ) -> NetplayResult<NetplaySession<T>>
    where
        S: Simulation<T> + ?Sized,
    {
        let state_size = sim.serialized_size();
        let config = match self.role {
            Role::Authoritative => {
                self.config.validate()?;
                let handshake = HandshakeInfo {
                    protocol_version: PROTOCOL_VERSION,
                    delay_frames: u32::try_from(self.config.delay_frames).map_err(|_| {
                        NetplayError::InvalidRequest {
                            info: format!("delay_frames {} too large", self.config.delay_frames),
                        }
                    })?,
                    state_size: state_size as u64,
                    strategy: self.config.strategy,
                };
                transport.send_handshake(&handshake)?;
                info!(
                    delay_frames = handshake.delay_frames,
                    state_size,
                    strategy = ?handshake.strategy,
                    "Handshake sent"
                );
                self.config
            }
            Role::Peer => {
                let handshake = transport.receive_handshake()?;
                let config = Self::adopt_handshake(&handshake, state_size)?;
                info!(
                    delay_frames = config.delay_frames,
                    state_size,
                    strategy = ?config.strategy,
                    "Handshake received"
                );
                config
            }
        };

        let sync = SyncLayer::new(config.delay_frames, state_size)?;
        Ok(NetplaySession::new(
            sync,
            self.role,
            config.strategy,
            transport,
            self.persistence,
            self.prediction,
            self.violation_observer,
        ))
    }

    fn adopt_handshake(handshake: &HandshakeInfo, state_size: usize) -> NetplayResult<NetplayConfig> {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(NetplayError::HandshakeFailed {
                reason: format!(
                    "protocol version {} does not match local version {}",
                    handshake.protocol_version, PROTOCOL_VERSION
                ),
            });
        }
        if handshake.state_size != state_size as u64 {
            return Err(NetplayError::HandshakeFailed {
                reason: format!(
                    "remote state size {} does not match local state size {}",
                    handshake.state_size, state_size
                ),
            });
        }

        let config = NetplayConfig {
            delay_frames: usize::try_from(handshake.delay_frames).unwrap_or(usize::MAX),
            strategy: handshake.strategy,
        };
        config
            .validate()
            .map_err(|err| NetplayError::HandshakeFailed {
                reason: err.to_string(),
            })?;
        Ok(config)
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::{Frame, FrameInputs, SyncMode};
    use std::sync::Mutex;

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
    }

    struct FixedSim(usize);

    impl Simulation<TestConfig> for FixedSim {
        fn serialized_size(&self) -> usize {
            self.0
        }
        fn serialize(&mut self, buf: &mut [u8]) -> NetplayResult<()> {
            buf.fill(0);
            Ok(())
        }
        fn deserialize(&mut self, _buf: &[u8]) -> NetplayResult<()> {
            Ok(())
        }
        fn run_one_step(&mut self, _inputs: &FrameInputs<u8>) {}
    }

    /// Hands out a canned handshake and records the one sent.
    #[derive(Default)]
    struct HandshakeOnly {
        incoming: Option<HandshakeInfo>,
        sent: Arc<Mutex<Vec<HandshakeInfo>>>,
    }

    impl Transport<TestConfig> for HandshakeOnly {
        fn send_handshake(&mut self, info: &HandshakeInfo) -> NetplayResult<()> {
            self.sent.lock().unwrap().push(*info);
            Ok(())
        }
        fn receive_handshake(&mut self) -> NetplayResult<HandshakeInfo> {
            self.incoming.take().ok_or(NetplayError::NotConnected)
        }
        fn send_input(&mut self, _frame: Frame, _input: &u8) {}
        fn send_checksum(&mut self, _frame: Frame, _checksum: u32) {}
        fn send_savestate(&mut self, _frame: Frame, _state: &[u8]) {}
        fn request_resync(&mut self, _frame: Frame) {}
    }

    fn announced(delay_frames: u32, state_size: u64) -> HandshakeInfo {
        HandshakeInfo {
            protocol_version: PROTOCOL_VERSION,
            delay_frames,
            state_size,
            strategy: FrameStrategy::Normal,
        }
    }

    #[test]
    fn builder_defaults() {
        let builder = SessionBuilder::<TestConfig>::new();
        assert_eq!(builder.role, Role::Authoritative);
        assert_eq!(builder.config, NetplayConfig::default());
        assert!(builder.violation_observer.is_none());
    }

    #[test]
    fn with_delay_frames_bounds() {
        assert!(SessionBuilder::<TestConfig>::new().with_delay_frames(1).is_ok());
        let builder = SessionBuilder::<TestConfig>::new()
            .with_delay_frames(MAX_DELAY_FRAMES)
            .unwrap();
        assert_eq!(builder.config.delay_frames, MAX_DELAY_FRAMES);

        assert!(matches!(
            SessionBuilder::<TestConfig>::new().with_delay_frames(0),
            Err(NetplayError::InvalidRequest { .. })
        ));
        assert!(matches!(
            SessionBuilder::<TestConfig>::new().with_delay_frames(MAX_DELAY_FRAMES + 1),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn with_config_is_validated_at_start() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_config(NetplayConfig {
                delay_frames: 0,
                ..NetplayConfig::default()
            })
            .start_session(Box::new(HandshakeOnly::default()), &FixedSim(4));
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
    }

    #[test]
    fn authoritative_announces_configuration() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = HandshakeOnly {
            incoming: None,
            sent: Arc::clone(&sent),
        };
        let session = SessionBuilder::<TestConfig>::new()
            .with_delay_frames(3)
            .unwrap()
            .with_strategy(FrameStrategy::Spectator)
            .start_session(Box::new(transport), &FixedSim(12))
            .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].delay_frames, 3);
        assert_eq!(sent[0].state_size, 12);
        assert_eq!(sent[0].strategy, FrameStrategy::Spectator);
        assert_eq!(sent[0].protocol_version, PROTOCOL_VERSION);

        assert_eq!(session.sync_layer().capacity(), 7);
        assert_eq!(session.sync_layer().state_size(), 12);
        assert_eq!(session.sync_mode(), SyncMode::Rollback);
        assert!(session.is_connected());
    }

    #[test]
    fn peer_adopts_announced_configuration() {
        let transport = HandshakeOnly {
            incoming: Some(announced(5, 8)),
            ..HandshakeOnly::default()
        };
        let session = SessionBuilder::<TestConfig>::new()
            .with_role(Role::Peer)
            .start_session(Box::new(transport), &FixedSim(8))
            .unwrap();

        assert_eq!(session.delay_frames(), 5);
        assert_eq!(session.sync_layer().capacity(), 11);
        assert_eq!(session.role(), Role::Peer);
    }

    #[test]
    fn peer_rejects_state_size_mismatch() {
        let transport = HandshakeOnly {
            incoming: Some(announced(5, 16)),
            ..HandshakeOnly::default()
        };
        let err = SessionBuilder::<TestConfig>::new()
            .with_role(Role::Peer)
            .start_session(Box::new(transport), &FixedSim(8))
            .unwrap_err();
        assert!(matches!(err, NetplayError::HandshakeFailed { .. }));
        assert!(err.to_string().contains("state size"));
    }

    #[test]
    fn peer_rejects_protocol_mismatch() {
        let mut handshake = announced(5, 8);
        handshake.protocol_version = PROTOCOL_VERSION + 1;
        let transport = HandshakeOnly {
            incoming: Some(handshake),
            ..HandshakeOnly::default()
        };
        let result = SessionBuilder::<TestConfig>::new()
            .with_role(Role::Peer)
            .start_session(Box::new(transport), &FixedSim(8));
        assert!(matches!(result, Err(NetplayError::HandshakeFailed { .. })));
    }

    #[test]
    fn peer_rejects_invalid_announced_delay() {
        let transport = HandshakeOnly {
            incoming: Some(announced(0, 8)),
            ..HandshakeOnly::default()
        };
        let result = SessionBuilder::<TestConfig>::new()
            .with_role(Role::Peer)
            .start_session(Box::new(transport), &FixedSim(8));
        assert!(matches!(result, Err(NetplayError::HandshakeFailed { .. })));
    }

    #[test]
    fn transport_error_aborts_start() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_role(Role::Peer)
            .start_session(Box::new(HandshakeOnly::default()), &FixedSim(8));
        assert!(matches!(result, Err(NetplayError::NotConnected)));
    }

    #[test]
    fn debug_output_mentions_role() {
        let builder = SessionBuilder::<TestConfig>::new().with_role(Role::Peer);
        let debug = format!("{builder:?}");
        assert!(debug.contains("SessionBuilder"));
        assert!(debug.contains("Peer"));
    }
}
