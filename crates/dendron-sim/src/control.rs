//! Run/reset controller and its control channel.
//!
//! [`Controller`] is the synchronous core: it owns the simulation, the
//! current time mark and the sample collection. [`spawn`] moves a controller
//! into a tokio task that is the only thing touching it afterwards; callers
//! talk to it with [`Command`]s and get [`Status`]es back.
//!
//! Text protocol (one command per line):
//!
//! ```text
//! ping                          -> pong
//! start [samples]               -> (0.0) (1.0) ... repeating until stopped
//! stop                          -> Stopped
//! load                          -> loaded | error: ...
//! set <target> <field> <value>  -> error: ... (only when rejected)
//! quit
//! ```

use crate::{Experiment, FieldUpdate, Simulation};
use dendron_cell::FieldChange;
use dendron_core::{Channel, DendronError, Result, SampleCollection, Spike, Time, TIME_STEP};
use dendron_stimulus::StimulusSettings;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// CONTROLLER
// ============================================================================

/// Outcome of a bounded run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub steps: usize,
    pub output_spikes: usize,
    pub mean_weight: f64,
    pub min_weight: f64,
    pub max_weight: f64,
}

pub struct Controller {
    experiment: Experiment,
    sim: Simulation,
    samples: SampleCollection,
    sample_count: usize,
    t: Time,
}

impl Controller {
    /// Build the network described by `experiment` and apply its persisted
    /// neuron model, if it has one.
    pub fn create(experiment: Experiment) -> Result<Self> {
        experiment.run.validate()?;
        let config = experiment.network_config()?;
        let mut sim = Simulation::build(config, &experiment.patterns)?;
        if let Some(model) = &experiment.stimulus.neuron {
            sim.load_model(model)?;
        }

        let sample_count = experiment.run.samples();
        let mut samples = SampleCollection::new(sim.synapse_count(), sample_count);
        let (start, end) = experiment.run.range();
        for channel in Channel::ALL {
            samples.channel_mut(channel).set_range(start, end);
        }

        log::info!(
            "Controller created: {} synapses, {} samples per run",
            sim.synapse_count(),
            sample_count
        );

        Ok(Self {
            experiment,
            sim,
            samples,
            sample_count,
            t: 0.0,
        })
    }

    /// Rewind time and reset the simulation.
    pub fn reset(&mut self) {
        self.t = 0.0;
        self.sim.reset();
    }

    /// One pass at the current time mark, then advance it.
    pub fn step(&mut self) -> Spike {
        let output = self.sim.step(self.t, &mut self.samples);
        self.t += TIME_STEP;
        output
    }

    /// Reset, run until the sample count is reached, then post-process.
    pub fn run_pause(&mut self) -> RunSummary {
        self.run_pause_with(|_| {})
    }

    /// Like [`Controller::run_pause`], calling `on_step` after every pass.
    pub fn run_pause_with(&mut self, mut on_step: impl FnMut(Time)) -> RunSummary {
        self.reset();
        log::info!("Starting run ({} samples)", self.sample_count);

        let mut steps = 0;
        let mut output_spikes = 0;
        while self.t < self.sample_count as Time {
            let t = self.t;
            output_spikes += self.step() as usize;
            steps += 1;
            on_step(t);
        }

        self.sim.post_process(&mut self.samples);
        let summary = self.summary(steps, output_spikes);
        log::info!(
            "Run complete: {} output spikes in {} steps",
            summary.output_spikes,
            summary.steps
        );
        summary
    }

    fn summary(&self, steps: usize, output_spikes: usize) -> RunSummary {
        let weights: Vec<f64> = self
            .sim
            .cell()
            .dendrite()
            .synapses()
            .map(|s| s.weight())
            .collect();
        let n = weights.len().max(1) as f64;
        RunSummary {
            steps,
            output_spikes,
            mean_weight: weights.iter().sum::<f64>() / n,
            min_weight: weights.iter().copied().fold(f64::INFINITY, f64::min),
            max_weight: weights.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }

    pub fn apply(&mut self, update: &FieldUpdate) -> FieldChange {
        self.sim.apply(update)
    }

    /// Write the stimulus settings with the current neuron model embedded.
    pub fn save_model(&self, path: &Path) -> Result<()> {
        let config = self.sim.config();
        let settings = StimulusSettings {
            scaler: config.scale as f64,
            hertz: config.hertz,
            firing_rate: config.firing_rate,
            poisson_pattern_max: config.poisson_pattern_max,
            threshold: Some(self.sim.cell().params().threshold),
            refractory_period: Some(self.sim.cell().params().refractory_period as f64),
            neuron: Some(self.sim.to_model()),
            ..self.experiment.stimulus.clone()
        };
        settings.to_file(path)?;
        log::info!("Saved model to {}", path.display());
        Ok(())
    }

    /// Apply the neuron model stored in a stimulus settings file.
    pub fn load_model(&mut self, path: &Path) -> Result<()> {
        let settings = StimulusSettings::from_file(path)?;
        let model = settings.neuron.ok_or_else(|| {
            DendronError::config(format!("{} has no Neuron model", path.display()))
        })?;
        self.sim.load_model(&model)?;
        log::info!("Loaded model from {}", path.display());
        Ok(())
    }

    /// Re-read the experiment's own stimulus set.
    pub fn reload(&mut self) -> Result<()> {
        let path = self
            .experiment
            .stimulus_path
            .clone()
            .ok_or_else(|| DendronError::config("experiment was not loaded from a file"))?;
        self.load_model(&path)
    }

    pub fn t(&self) -> Time {
        self.t
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    pub fn samples(&self) -> &SampleCollection {
        &self.samples
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }
}

// ============================================================================
// PROTOCOL
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    /// Free-running loop; `None` uses the configured sample count
    Start { samples: Option<usize> },
    Stop,
    /// Re-read the neuron model from the stimulus set
    Load,
    Set(FieldUpdate),
    Quit,
}

impl FromStr for Command {
    type Err = DendronError;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(DendronError::parse("empty command"));
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "ping" => Command::Ping,
            "start" => {
                let samples = match words.next() {
                    None => None,
                    Some(n) => Some(parse_samples(n)?),
                };
                Command::Start { samples }
            }
            "stop" => Command::Stop,
            "load" => Command::Load,
            "set" => {
                let (Some(target), Some(field), Some(value)) =
                    (words.next(), words.next(), words.next())
                else {
                    return Err(DendronError::parse("usage: set <target> <field> <value>"));
                };
                Command::Set(FieldUpdate {
                    target: target.parse()?,
                    field: field.to_string(),
                    value: value.to_string(),
                })
            }
            "quit" | "exit" => Command::Quit,
            other => return Err(DendronError::parse(format!("unknown command {other:?}"))),
        };

        if let Some(extra) = words.next() {
            return Err(DendronError::parse(format!("unexpected argument {extra:?}")));
        }
        Ok(command)
    }
}

/// Sample counts may arrive as `1000` or `1000.0`.
fn parse_samples(word: &str) -> Result<usize> {
    if let Ok(n) = word.parse::<usize>() {
        return Ok(n);
    }
    match word.parse::<f64>() {
        Ok(v) if v >= 0.0 && v.fract() == 0.0 && v.is_finite() => Ok(v as usize),
        _ => Err(DendronError::parse(format!("bad sample count {word:?}"))),
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ping => write!(f, "ping"),
            Command::Start { samples: None } => write!(f, "start"),
            Command::Start { samples: Some(n) } => write!(f, "start {n}"),
            Command::Stop => write!(f, "stop"),
            Command::Load => write!(f, "load"),
            Command::Set(u) => write!(f, "set {} {} {}", u.target, u.field, u.value),
            Command::Quit => write!(f, "quit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Pong,
    /// A step at this time mark finished
    Tick(Time),
    Stopped,
    Loaded,
    Error(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pong => write!(f, "pong"),
            Status::Tick(t) => write!(f, "({t:.1})"),
            Status::Stopped => write!(f, "Stopped"),
            Status::Loaded => write!(f, "loaded"),
            Status::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

// ============================================================================
// CONTROL TASK
// ============================================================================

/// Caller side of a spawned controller.
pub struct ControlHandle {
    commands: mpsc::Sender<Command>,
    status: mpsc::Receiver<Status>,
}

impl ControlHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DendronError::Simulation("controller task has exited".to_string()))
    }

    /// Parse and send one protocol line.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        self.send(line.parse()?).await
    }

    /// `None` once the task has exited and every status was read.
    pub async fn recv(&mut self) -> Option<Status> {
        self.status.recv().await
    }

    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }
}

/// Move `controller` into its own task. `capacity` bounds both channels.
/// The join handle yields the controller back when the task exits.
pub fn spawn(controller: Controller, capacity: usize) -> (ControlHandle, JoinHandle<Controller>) {
    let capacity = capacity.max(1);
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (status_tx, status_rx) = mpsc::channel(capacity);

    let task = ControlTask {
        controller,
        commands: command_rx,
        status: status_tx,
        outbox: VecDeque::new(),
        running: false,
        target: 0,
    };
    let join = tokio::spawn(task.run());

    (
        ControlHandle {
            commands: command_tx,
            status: status_rx,
        },
        join,
    )
}

enum Flow {
    Continue,
    Quit,
}

enum Event {
    Command(Option<Command>),
    Delivered,
    Closed,
    Step,
}

/// Statuses wait in `outbox` until the channel has room. The loop only steps
/// once the outbox is empty, and commands are polled first, so a slow status
/// reader throttles the run without ever hiding `stop` or `quit`.
struct ControlTask {
    controller: Controller,
    commands: mpsc::Receiver<Command>,
    status: mpsc::Sender<Status>,
    outbox: VecDeque<Status>,
    running: bool,
    target: usize,
}

impl ControlTask {
    async fn run(mut self) -> Controller {
        log::info!("Control task started");

        loop {
            let event = tokio::select! {
                biased;
                command = self.commands.recv() => Event::Command(command),
                permit = self.status.reserve(), if !self.outbox.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(status) = self.outbox.pop_front() {
                            permit.send(status);
                        }
                        Event::Delivered
                    }
                    Err(_) => Event::Closed,
                },
                _ = std::future::ready(()), if self.running && self.outbox.is_empty() => Event::Step,
            };

            match event {
                Event::Command(None) => break,
                Event::Command(Some(command)) => {
                    if let Flow::Quit = self.handle(command) {
                        break;
                    }
                }
                Event::Delivered => {}
                Event::Closed => {
                    log::warn!("Status receiver dropped; stopping");
                    break;
                }
                Event::Step => self.advance().await,
            }
        }

        self.flush();
        log::info!("Control task exited");
        self.controller
    }

    /// One iteration of the free-running loop.
    async fn advance(&mut self) {
        if self.controller.t() >= self.target as Time {
            self.controller.reset();
            tokio::task::yield_now().await;
            return;
        }
        let t = self.controller.t();
        self.controller.step();
        log::trace!("Step ({t:.1})");
        self.outbox.push_back(Status::Tick(t));
    }

    fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Ping => self.reply(Status::Pong),
            Command::Start { samples } => {
                if self.running {
                    return Flow::Continue;
                }
                let target = samples.unwrap_or(self.controller.sample_count());
                if target == 0 {
                    self.reply(Status::Error("start needs a positive sample count".into()));
                    return Flow::Continue;
                }
                self.target = target;
                self.controller.reset();
                self.running = true;
                log::info!("Running ({target} samples per pass)");
            }
            Command::Stop => {
                if self.running {
                    self.running = false;
                    log::info!("Stopped at ({:.1})", self.controller.t());
                    self.reply(Status::Stopped);
                }
            }
            Command::Load => match self.controller.reload() {
                Ok(()) => self.reply(Status::Loaded),
                Err(e) => self.reply(Status::Error(e.to_string())),
            },
            Command::Set(update) => {
                if let FieldChange::Rejected(reason) = self.controller.apply(&update) {
                    self.reply(Status::Error(reason));
                }
            }
            Command::Quit => {
                if self.running {
                    self.running = false;
                    self.reply(Status::Stopped);
                }
                return Flow::Quit;
            }
        }
        Flow::Continue
    }

    fn reply(&mut self, status: Status) {
        self.outbox.push_back(status);
    }

    /// Hand over whatever fits without waiting; the rest is dropped.
    fn flush(&mut self) {
        while let Some(status) = self.outbox.pop_front() {
            if self.status.try_send(status).is_err() {
                log::debug!("{} undelivered statuses dropped", self.outbox.len() + 1);
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldTarget, RunSettings};

    fn experiment() -> Experiment {
        let run = RunSettings {
            duration: 0.05,
            time_step: 1000.0,
            synapse_count: 6,
            ..RunSettings::default()
        };
        let stimulus = StimulusSettings {
            hertz: 200.0,
            ..StimulusSettings::default()
        };
        Experiment::new(run, stimulus, vec![vec![1, 0, 1, 1], vec![0, 1, 0, 1]])
    }

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("dendron-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_run_pause() {
        let mut ctl = Controller::create(experiment()).unwrap();
        assert_eq!(ctl.sample_count(), 50);

        let mut seen = vec![];
        let summary = ctl.run_pause_with(|t| seen.push(t));
        assert_eq!(summary.steps, 50);
        assert_eq!(ctl.t(), 50.0);
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&49.0));
        assert!(summary.min_weight >= 0.0 && summary.max_weight <= 10.0);

        let again = ctl.run_pause();
        assert_eq!(summary, again);
    }

    #[test]
    fn test_save_and_load_model() {
        let dir = temp_dir("model");
        let path = dir.join("saved.json");

        let mut ctl = Controller::create(experiment()).unwrap();
        ctl.apply(&FieldUpdate::new(FieldTarget::Synapse, "lambda", "0.5"));
        ctl.apply(&FieldUpdate::new(FieldTarget::Neuron, "threshold", "0.75"));
        ctl.run_pause();
        ctl.save_model(&path).unwrap();

        let mut fresh = Controller::create(experiment()).unwrap();
        assert_ne!(fresh.simulation().to_model(), ctl.simulation().to_model());
        fresh.load_model(&path).unwrap();
        assert_eq!(fresh.simulation().to_model(), ctl.simulation().to_model());

        // A model for a different topology is rejected
        let mut other = experiment();
        other.run.synapse_count = 4;
        let mut small = Controller::create(other).unwrap();
        assert!(small.load_model(&path).is_err());

        // No file to reload from
        assert!(fresh.reload().is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_demo_stimulus_set_reloads() {
        let settings = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/neuron.json");
        let experiment = Experiment::load(&settings, None).unwrap();
        assert!(experiment.stimulus.neuron.is_some());

        let mut ctl = Controller::create(experiment).unwrap();
        assert_eq!(ctl.simulation().synapse_count(), 10);
        ctl.reload().unwrap();
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("ping".parse::<Command>().unwrap(), Command::Ping);
        assert_eq!(
            "start 1000".parse::<Command>().unwrap(),
            Command::Start { samples: Some(1000) }
        );
        assert_eq!(
            "start 250.0".parse::<Command>().unwrap(),
            Command::Start { samples: Some(250) }
        );
        assert_eq!("start".parse::<Command>().unwrap(), Command::Start { samples: None });
        assert_eq!(
            "set synapse taoP 20".parse::<Command>().unwrap(),
            Command::Set(FieldUpdate::new(FieldTarget::Synapse, "taoP", "20"))
        );
        assert_eq!("  quit ".parse::<Command>().unwrap(), Command::Quit);

        assert!("".parse::<Command>().is_err());
        assert!("jump".parse::<Command>().is_err());
        assert!("start -4".parse::<Command>().is_err());
        assert!("set synapse taoP".parse::<Command>().is_err());
        assert!("set axon taoP 3".parse::<Command>().is_err());
        assert!("stop now".parse::<Command>().is_err());

        let line = "set dendrite length 12";
        assert_eq!(line.parse::<Command>().unwrap().to_string(), line);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(Status::Pong.to_string(), "pong");
        assert_eq!(Status::Tick(12.0).to_string(), "(12.0)");
        assert_eq!(Status::Stopped.to_string(), "Stopped");
        assert_eq!(Status::Loaded.to_string(), "loaded");
        assert_eq!(Status::Error("x".into()).to_string(), "error: x");
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let ctl = Controller::create(experiment()).unwrap();
        let (mut handle, join) = spawn(ctl, 8);

        handle.send(Command::Ping).await.unwrap();
        assert_eq!(handle.recv().await, Some(Status::Pong));

        handle.send(Command::Quit).await.unwrap();
        let ctl = join.await.unwrap();
        assert_eq!(ctl.t(), 0.0);
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let ctl = Controller::create(experiment()).unwrap();
        let (mut handle, join) = spawn(ctl, 8);

        handle.send(Command::Stop).await.unwrap();
        handle.send(Command::Ping).await.unwrap();
        assert_eq!(handle.recv().await, Some(Status::Pong));

        handle.send(Command::Quit).await.unwrap();
        join.await.unwrap();
        assert_eq!(handle.recv().await, None);
    }

    #[tokio::test]
    async fn test_start_ticks_then_stop() {
        let ctl = Controller::create(experiment()).unwrap();
        let (mut handle, join) = spawn(ctl, 4);

        handle.send_line("start 20").await.unwrap();

        // Runs past the sample count, resetting and continuing
        let mut ticks = vec![];
        while ticks.len() < 45 {
            match handle.recv().await {
                Some(Status::Tick(t)) => ticks.push(t),
                other => panic!("unexpected status {other:?}"),
            }
        }
        assert_eq!(&ticks[..3], &[0.0, 1.0, 2.0]);
        assert_eq!(ticks[19], 19.0);
        assert_eq!(ticks[20], 0.0);

        // Start while running changes nothing
        handle.send_line("start 5").await.unwrap();
        handle.send(Command::Stop).await.unwrap();

        let mut last_tick = *ticks.last().unwrap();
        loop {
            match handle.recv().await {
                Some(Status::Tick(t)) => last_tick = t,
                Some(Status::Stopped) => break,
                other => panic!("unexpected status {other:?}"),
            }
        }
        assert!(last_tick < 20.0);

        handle.send(Command::Quit).await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_and_quit_without_draining_statuses() {
        let ctl = Controller::create(experiment()).unwrap();
        let (mut handle, join) = spawn(ctl, 2);

        handle.send_line("start 20").await.unwrap();
        assert_eq!(handle.recv().await, Some(Status::Tick(0.0)));

        // Let the task fill the status channel, then stop reading
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        handle.send(Command::Stop).await.unwrap();
        handle.send(Command::Quit).await.unwrap();

        let ctl = tokio::time::timeout(std::time::Duration::from_secs(2), join)
            .await
            .expect("control task kept waiting on the status channel")
            .unwrap();
        assert!(ctl.t() > 0.0);

        // Whatever was queued is still readable, then the channel closes
        while let Some(status) = handle.recv().await {
            assert!(matches!(status, Status::Tick(_) | Status::Stopped));
        }
    }

    #[tokio::test]
    async fn test_load_applies_stored_model() {
        let dir = temp_dir("load");
        let stim_dir = dir.join("stimulus");
        std::fs::create_dir_all(&stim_dir).unwrap();

        let run = RunSettings {
            duration: 0.05,
            time_step: 1000.0,
            synapse_count: 6,
            stimulus: "set1".to_string(),
            ..RunSettings::default()
        };
        let settings_path = dir.join("neuron.json");
        std::fs::write(&settings_path, serde_json::to_string(&run).unwrap()).unwrap();
        let stimulus = StimulusSettings {
            hertz: 200.0,
            ..StimulusSettings::default()
        };
        stimulus.to_file(&stim_dir.join("set1.json")).unwrap();
        std::fs::write(stim_dir.join("set1.txt"), "|.||\n.|.|\n").unwrap();

        let experiment = Experiment::load(&settings_path, None).unwrap();
        let stimulus_path = experiment.stimulus_path.clone().unwrap();

        // Train a second controller and store its model in the stimulus set
        let mut trained = Controller::create(experiment.clone()).unwrap();
        trained.apply(&FieldUpdate::new(FieldTarget::Neuron, "threshold", "0.75"));
        trained.apply(&FieldUpdate::new(FieldTarget::Synapse, "lambda", "0.5"));
        trained.run_pause();
        trained.save_model(&stimulus_path).unwrap();
        let expected = trained.simulation().to_model();

        let ctl = Controller::create(experiment).unwrap();
        assert_ne!(ctl.simulation().to_model(), expected);
        let (mut handle, join) = spawn(ctl, 8);

        handle.send_line("load").await.unwrap();
        assert_eq!(handle.recv().await, Some(Status::Loaded));

        handle.send(Command::Quit).await.unwrap();
        let ctl = join.await.unwrap();
        assert_eq!(ctl.simulation().to_model(), expected);
        assert_eq!(ctl.simulation().cell().params().threshold, 0.75);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_set_and_load_over_channel() {
        let ctl = Controller::create(experiment()).unwrap();
        let (mut handle, join) = spawn(ctl, 8);

        handle.send_line("set neuron threshold 3.5").await.unwrap();
        handle.send_line("set neuron ntao 0").await.unwrap();
        match handle.recv().await {
            Some(Status::Error(msg)) => assert!(msg.contains("ntao")),
            other => panic!("unexpected status {other:?}"),
        }

        // In-memory experiment has nothing to reload
        handle.send(Command::Load).await.unwrap();
        assert!(matches!(handle.recv().await, Some(Status::Error(_))));

        handle.send(Command::Quit).await.unwrap();
        let ctl = join.await.unwrap();
        assert_eq!(ctl.simulation().cell().params().threshold, 3.5);
    }
}
