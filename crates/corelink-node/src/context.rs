use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use corelink_framework::{
    Endpoint, EndpointConfig, EngineConfig, Identity, Runner, ServiceHandler, ServiceType,
    TransactionEngine, WireFormat,
};
use corelink_transport::{
    parse_port_range, DirectoryConfig, TcpTransport, TransportConfig, UdpDirectory,
};

use crate::echo::{EchoExecutor, ECHO_REQUEST};
use crate::events::{emit, EventStarted, EventStopped, EventSummary};
use crate::hub::HubHandler;
use crate::peer::{self, PeerHandler, PeerState};

/// Options shared by both roles.
pub struct NodeOptions {
    pub name: Option<String>,
    pub domain: String,
    pub group: Ipv4Addr,
    pub group_port: u16,
    pub listen: String,
    pub ports: Option<String>,
    pub msgpack: bool,
}

enum RoleState {
    Hub {
        engine: Arc<TransactionEngine>,
        executor: Arc<EchoExecutor>,
    },
    Peer {
        state: Arc<PeerState>,
        pinger: Runner,
        interval: Duration,
    },
}

/// Everything one node owns, from start to shutdown.
pub struct NodeContext {
    endpoint: Endpoint,
    role: RoleState,
    start: Instant,
}

impl NodeContext {
    pub fn hub(options: &NodeOptions, sessions: u32) -> anyhow::Result<Self> {
        let endpoint = build_endpoint(options, ServiceType::Core)?;
        let engine = Arc::new(TransactionEngine::new(
            EngineConfig::new().session_count(sessions),
        ));
        let executor = Arc::new(EchoExecutor::new(endpoint.handle()));
        engine.register_executor(ECHO_REQUEST, executor.clone())?;
        Ok(Self {
            endpoint,
            role: RoleState::Hub { engine, executor },
            start: Instant::now(),
        })
    }

    pub fn peer(options: &NodeOptions, service_type: ServiceType, interval: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(!service_type.is_hub(), "a peer cannot be of type {service_type}");
        let endpoint = build_endpoint(options, service_type)?;
        Ok(Self {
            endpoint,
            role: RoleState::Peer {
                state: Arc::new(PeerState::default()),
                pinger: Runner::new("echo"),
                interval,
            },
            start: Instant::now(),
        })
    }

    /// Start the endpoint and, on a peer, the echo routine.
    pub async fn start(&self) -> anyhow::Result<()> {
        let handler: Arc<dyn ServiceHandler> = match &self.role {
            RoleState::Hub { engine, .. } => Arc::new(HubHandler::new(engine.clone(), self.start)),
            RoleState::Peer { state, .. } => Arc::new(PeerHandler::new(state.clone(), self.start)),
        };
        self.endpoint.start(handler).await?;

        if let RoleState::Peer {
            state,
            pinger,
            interval,
        } = &self.role
        {
            let endpoint = self.endpoint.handle();
            let state = state.clone();
            let interval = *interval;
            pinger.start(move |controller| {
                peer::echo_routine(controller, endpoint, state, interval)
            })?;
        }

        let role = match self.role {
            RoleState::Hub { .. } => "hub",
            RoleState::Peer { .. } => "peer",
        };
        emit(&EventStarted::new(
            self.endpoint.name(),
            role,
            &self.endpoint.listen_address().unwrap_or_default(),
            self.endpoint.listen_port().unwrap_or_default(),
        ));
        eprintln!(
            "{} ({}) in domain '{}', listening on {}:{}",
            self.endpoint.name(),
            self.endpoint.service_type(),
            self.endpoint.domain(),
            self.endpoint.listen_address().unwrap_or_default(),
            self.endpoint.listen_port().unwrap_or_default()
        );
        eprintln!("Press Ctrl+C to stop.\n");
        Ok(())
    }

    /// Block until Ctrl+C.
    pub async fn wait(&self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await?;
        eprintln!("\nCtrl+C received, shutting down...");
        Ok(())
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        if let RoleState::Peer { pinger, .. } = &self.role {
            if let Err(e) = pinger.stop().await {
                tracing::debug!("node: echo routine: {e}");
            }
        }
        self.endpoint.stop().await?;

        let summary = match &self.role {
            RoleState::Hub { engine, executor } => EventSummary {
                event: "summary",
                sent: 0,
                answered: 0,
                executed: executor.executed(),
                dropped: engine.stats().dropped.get(),
                elapsed_s: self.start.elapsed().as_secs_f64(),
            },
            RoleState::Peer { state, .. } => EventSummary {
                event: "summary",
                sent: state.sent.load(Ordering::Relaxed),
                answered: state.answered.load(Ordering::Relaxed),
                executed: 0,
                dropped: 0,
                elapsed_s: self.start.elapsed().as_secs_f64(),
            },
        };
        emit(&summary);
        emit(&EventStopped {
            event: "stopped",
            name: self.endpoint.name().to_string(),
            elapsed_s: self.start.elapsed().as_secs_f64(),
        });
        Ok(())
    }
}

fn build_endpoint(options: &NodeOptions, service_type: ServiceType) -> anyhow::Result<Endpoint> {
    let identity = match &options.name {
        Some(name) => Identity::new(name, service_type),
        None => Identity::generate(service_type, None)?,
    }
    .domain(&options.domain)
    .group(&options.group.to_string(), options.group_port)
    .listen_address(&options.listen);

    let mut transport = TransportConfig::new();
    if let Some(ports) = &options.ports {
        transport = transport.port_range(parse_port_range(ports)?);
    }

    let directory = UdpDirectory::new(
        DirectoryConfig::new(&options.domain).group(options.group, options.group_port),
    );

    let mut config = EndpointConfig::new();
    if options.msgpack {
        config = config.wire_format(WireFormat::MessagePack);
    }

    Ok(Endpoint::new(
        identity,
        config,
        Arc::new(TcpTransport::new(transport)),
        Arc::new(directory),
    ))
}
