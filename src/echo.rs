//! The role-asymmetric driver of one echo run.
//!
//! A server brings its QP up to RTS and writes the payload into the
//! client's buffer; a client brings its QP up to RTR (or RTS if configured)
//! and waits until the payload lands.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::{ConfigError, EchoConfig};
use crate::ctrl::{ExchangeError, MetadataChannel, MetadataListener};
use crate::rdma::endpoint::{ConnectionEndpoint, SetupError};
use crate::rdma::info::ConnectionInfo;
use crate::rdma::qp::{QpState, TransitionError};
use crate::rdma::verbs::Verbs;
use crate::rdma::wr::{DataPlaneError, WaitError};
use crate::timing::PhaseTimer;

/// Which side of the exchange this process plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Listen, accept one client and write to it.
    Server,
    /// Connect to the named server and wait for its write.
    Client { server: String },
}

impl Role {
    /// Server without a server name, client with one.
    pub fn from_server_name(name: Option<String>) -> Self {
        match name {
            None => Role::Server,
            Some(server) => Role::Client { server },
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client { server } => write!(f, "client of {}", server),
        }
    }
}

/// Progress of a run. Phases only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    #[default]
    Init,
    LocalAddressResolved,
    MetadataExchanged,
    QpReady,
    ServerWrites,
    ClientWaits,
    Teardown,
}

/// Any failure of a run.
#[derive(Debug, Error)]
pub enum EchoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("payload of {len} bytes does not fit in a {capacity}-byte buffer half")]
    Payload { len: usize, capacity: usize },

    #[error("resource setup failed")]
    Setup(#[from] SetupError),

    #[error("QP bring-up failed")]
    Transition(#[from] TransitionError),

    #[error("metadata exchange failed")]
    Exchange(#[from] ExchangeError),

    #[error("RDMA write failed")]
    DataPlane(#[from] DataPlaneError),

    #[error("waiting for the peer's write failed")]
    Wait(#[from] WaitError),
}

impl EchoError {
    /// Process exit code. Setup failures keep their per-step codes.
    pub fn exit_code(&self) -> i32 {
        match self {
            EchoError::Config(_) => 3,
            EchoError::Payload { .. } => 4,
            EchoError::Setup(e) => e.code(),
            EchoError::Transition(_) => 30,
            EchoError::Exchange(_) => 40,
            EchoError::DataPlane(_) => 50,
            EchoError::Wait(_) => 60,
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub local: ConnectionInfo,
    pub remote: ConnectionInfo,
    /// What the client received; `None` on the server.
    pub message: Option<String>,
    /// State the local QP was in when the run finished.
    pub qp_state: QpState,
    pub laps: Vec<(&'static str, Duration)>,
}

/// One echo run over the verbs provider `V`.
pub struct Session<V: Verbs + Clone> {
    verbs: V,
    config: EchoConfig,
    phase: Phase,
    timer: PhaseTimer,
}

impl<V: Verbs + Clone> Session<V> {
    pub fn new(verbs: V, config: EchoConfig) -> Result<Self, EchoError> {
        config.validate()?;
        Ok(Self {
            verbs,
            config,
            phase: Phase::Init,
            timer: PhaseTimer::new(),
        })
    }

    pub fn config(&self) -> &EchoConfig {
        &self.config
    }

    /// The last phase completed. After a failure, the phase before the
    /// failing step.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug_assert!(phase >= self.phase);
        log::debug!("phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Run as `role`, binding the configured port when serving.
    pub fn run(&mut self, role: &Role) -> Result<Outcome, EchoError> {
        log::info!("running as {}", role);
        match role {
            Role::Server => {
                let listener = MetadataListener::bind(self.config.port)?;
                self.serve(listener)
            }
            Role::Client { server } => self.run_client(server),
        }
    }

    /// Server side on an already bound listener.
    pub fn serve(&mut self, listener: MetadataListener) -> Result<Outcome, EchoError> {
        let mut ep = self.setup()?;
        let local = self.resolve(&ep)?;

        let mut channel = self.timer.time("accept", || listener.accept())?;
        log::info!("accepted {}", channel.peer_addr());
        let remote = self.exchange(&mut channel, &local)?;

        ep.connect(&remote)?;
        ep.ready_to_send(local.psn)?;
        self.timer.lap("connect");
        self.enter(Phase::QpReady);

        self.enter(Phase::ServerWrites);
        let mut data = self.config.payload.clone().into_bytes();
        data.push(0);
        if !ep.fill_local(&data) {
            return Err(EchoError::Payload {
                len: data.len(),
                capacity: ep.half_size(),
            });
        }
        let imm = self.config.notify.then_some(self.config.payload.len() as u32);
        let wc = ep.write_remote(&remote, imm, self.config.completion_timeout())?;
        self.timer.lap("write");
        log::debug!("write completed: {:?}", wc);
        log::info!("wrote {:?} to {:#x}", self.config.payload, remote.vaddr);

        Ok(self.finish(ep, channel, local, remote, None))
    }

    /// Client side against `server`.
    pub fn run_client(&mut self, server: &str) -> Result<Outcome, EchoError> {
        let mut ep = self.setup()?;
        if self.config.notify {
            ep.post_notify_recv()?;
        }
        let local = self.resolve(&ep)?;

        let opts = self.config.connect_options();
        let port = self.config.port;
        let mut channel = self
            .timer
            .time("dial", || MetadataChannel::connect(server, port, &opts))?;
        log::info!("connected to {}", channel.peer_addr());
        let remote = self.exchange(&mut channel, &local)?;

        ep.connect(&remote)?;
        if self.config.client_rts {
            ep.ready_to_send(local.psn)?;
        }
        self.timer.lap("connect");
        self.enter(Phase::QpReady);

        self.enter(Phase::ClientWaits);
        let bytes = ep.wait_remote_write(self.config.wait_timeout(), self.config.notify)?;
        self.timer.lap("wait");
        let message = String::from_utf8_lossy(&bytes).into_owned();
        log::info!("received {:?}", message);

        Ok(self.finish(ep, channel, local, remote, Some(message)))
    }

    fn setup(&mut self) -> Result<ConnectionEndpoint<V>, EchoError> {
        let params = self.config.endpoint_params();
        let ep = ConnectionEndpoint::new(self.verbs.clone(), params)?;
        self.timer.lap("setup");
        log::debug!("{:?}", ep);
        Ok(ep)
    }

    fn resolve(&mut self, ep: &ConnectionEndpoint<V>) -> Result<ConnectionInfo, EchoError> {
        let local = ep.local_info()?;
        self.timer.lap("resolve");
        log::info!("local address:  {}", local);
        self.enter(Phase::LocalAddressResolved);
        Ok(local)
    }

    fn exchange(
        &mut self,
        channel: &mut MetadataChannel,
        local: &ConnectionInfo,
    ) -> Result<ConnectionInfo, EchoError> {
        channel.set_timeout(self.config.exchange_timeout())?;
        let remote = self.timer.time("exchange", || channel.exchange(local))?;
        log::info!("remote address: {}", remote);
        self.enter(Phase::MetadataExchanged);
        Ok(remote)
    }

    fn finish(
        &mut self,
        ep: ConnectionEndpoint<V>,
        channel: MetadataChannel,
        local: ConnectionInfo,
        remote: ConnectionInfo,
        message: Option<String>,
    ) -> Outcome {
        self.enter(Phase::Teardown);
        let qp_state = ep.state();
        drop(ep);
        drop(channel);
        log::info!("done in {:?} ({})", self.timer.total(), self.timer);
        Outcome {
            local,
            remote,
            message,
            qp_state,
            laps: self.timer.laps().to_vec(),
        }
    }
}
