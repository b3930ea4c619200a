//! Scripted softphone sessions against the in-memory engine.
//!
//! ```text
//! callmux-sim [basic|multi|transfer|failure] [settings.json]
//! ```
//!
//! Every published event is printed to stdout as one JSON line; logs go to
//! stderr.

use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use callmux_core::engine::{EngineEventReceiver, SessionId};
use callmux_core::loopback::LoopbackEngine;
use callmux_core::{
    PhoneError, PhoneEvent, PhoneEventListener, PhoneManager, PhoneSettings, PlayoutRouter, RemoteAudio,
};

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "callmux_core=debug,callmux_sim=info".into()),
            )
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init();
    });
}

/// Prints every event as a JSON line.
struct JsonPrinter;

impl PhoneEventListener for JsonPrinter {
    fn on_event(&self, event: PhoneEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!("cannot serialize {event:?}: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Basic,
    Multi,
    Transfer,
    Failure,
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Self::Basic),
            "multi" => Ok(Self::Multi),
            "transfer" => Ok(Self::Transfer),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown scenario {other:?} (basic, multi, transfer, failure)")),
        }
    }
}

/// A connected phone whose engine events are pumped by hand.
struct Sim {
    phone: PhoneManager,
    engine: LoopbackEngine,
    events: EngineEventReceiver,
    host: String,
}

impl Sim {
    async fn start(settings: PhoneSettings) -> Result<Self, PhoneError> {
        let host = settings.signaling_host.clone().unwrap_or_default();
        let engine = LoopbackEngine::new();
        let phone = PhoneManager::new(Arc::new(engine.clone()), settings)
            .with_audio_sink(Arc::new(PlayoutRouter::new()));
        phone.add_listener(Arc::new(JsonPrinter));

        let events = phone.connect_detached().await?;
        let mut sim = Self { phone, engine, events, host };
        sim.pump().await;
        Ok(sim)
    }

    async fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.phone.handle_engine_event(event).await;
        }
    }

    fn remote(&self, extension: &str) -> String {
        format!("sip:{extension}@{}", self.host)
    }

    async fn ring_and_answer(&mut self, extension: &str, name: &str) -> Result<SessionId, PhoneError> {
        let id = self.engine.incoming(&self.remote(extension), Some(name));
        self.pump().await;
        self.phone.answer(&id).await?;
        self.pump().await;
        self.engine
            .peer_ready(&id, RemoteAudio::Track { track_id: format!("audio-{extension}") })?;
        self.pump().await;
        Ok(id)
    }

    async fn dial_and_connect(&mut self, extension: &str) -> Result<SessionId, PhoneError> {
        let id = self.phone.dial(extension, "200", "desk").await?;
        self.engine.remote_ringing(&id)?;
        self.engine.remote_answer(&id)?;
        self.pump().await;
        Ok(id)
    }

    async fn finish(mut self) -> Result<(), PhoneError> {
        for call in self.phone.calls().await {
            tracing::info!("hanging up leftover call {}", call.session_id);
            self.phone.hangup(&call.session_id).await?;
        }
        self.pump().await;
        self.phone.unregister().await?;
        self.pump().await;
        Ok(())
    }
}

async fn basic(mut sim: Sim) -> Result<(), PhoneError> {
    let call = sim.ring_and_answer("3001", "Alice").await?;
    sim.phone.mute(&call).await?;
    sim.phone.mute(&call).await?;
    sim.phone.send_digits(&call, "1234#").await?;
    sim.phone.hold(&call).await?;
    sim.phone.hold(&call).await?;
    sim.pump().await;

    sim.engine.remote_hangup(&call)?;
    sim.pump().await;
    sim.finish().await
}

async fn multi(mut sim: Sim) -> Result<(), PhoneError> {
    let first = sim.dial_and_connect("1001").await?;
    // Answering puts the first call on hold.
    let second = sim.ring_and_answer("3002", "Bob").await?;
    tracing::info!("{} calls active", sim.phone.calls().await.len());

    sim.phone.hangup(&second).await?;
    sim.pump().await;
    sim.phone.hold(&first).await?;
    sim.pump().await;
    sim.finish().await
}

async fn transfer(mut sim: Sim) -> Result<(), PhoneError> {
    let call = sim.ring_and_answer("3001", "Alice").await?;
    let consult = sim.phone.assisted_transfer(&call, "1003").await?;
    sim.pump().await;

    sim.engine.remote_answer(&consult)?;
    sim.pump().await;
    // Ending the consultation commits the transfer.
    sim.engine.remote_hangup(&consult)?;
    sim.pump().await;
    sim.finish().await
}

async fn failure(mut sim: Sim) -> Result<(), PhoneError> {
    let busy = sim.phone.dial("1001", "", "").await?;
    sim.engine.remote_fail(&busy, "Busy")?;
    sim.pump().await;

    let cancelled = sim.phone.dial("1002", "", "").await?;
    sim.engine.remote_ringing(&cancelled)?;
    sim.pump().await;
    sim.phone.hangup(&cancelled).await?;
    sim.pump().await;

    let rejected = sim.engine.incoming(&sim.remote("3003"), None);
    sim.pump().await;
    sim.phone.hangup(&rejected).await?;
    sim.pump().await;

    if let Err(e) = sim.phone.dial("", "", "").await {
        tracing::info!("empty target refused: {e}");
    }
    sim.finish().await
}

fn load_settings(path: Option<&str>) -> Result<PhoneSettings, PhoneError> {
    match path {
        Some(path) => PhoneSettings::from_json_file(path),
        None => {
            let mut settings = PhoneSettings::default();
            settings.set_parameters("pbx.local", None, "200", "secret")?;
            Ok(settings)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let mut args = std::env::args().skip(1);
    let scenario = match args.next().as_deref().unwrap_or("basic").parse::<Scenario>() {
        Ok(scenario) => scenario,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    let mut settings = match load_settings(args.next().as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    if scenario == Scenario::Multi {
        settings.allow_multiple_calls = true;
    }

    let sim = match Sim::start(settings).await {
        Ok(sim) => sim,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    tracing::info!("running {scenario:?} scenario");

    let outcome = match scenario {
        Scenario::Basic => basic(sim).await,
        Scenario::Multi => multi(sim).await,
        Scenario::Transfer => transfer(sim).await,
        Scenario::Failure => failure(sim).await,
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{scenario:?} scenario failed: {e}");
            ExitCode::FAILURE
        }
    }
}
