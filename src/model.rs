use rand::{Rng, seq::SliceRandom};

/// Immunity of an agent against one target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetState {
    pub immune: bool,
    /// Day the agent becomes immune.
    pub imm_day: Option<usize>,
    /// Day the agent loses immunity.
    pub loss_day: Option<usize>,
}

/// Agent of the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    id: usize,
    pub targets: Vec<TargetState>,

    /// Number of received doses.
    pub doses: usize,
    /// Day of the last dose.
    pub vacc_day: Option<usize>,

    /// Current or last infection was detected.
    pub confirmed: bool,
    /// Currently infected.
    pub active: bool,
    /// Recovered from at least one infection.
    pub recovered: bool,
    pub rec_day: Option<usize>,
    pub conf_day: Option<usize>,
    /// Variant of the last detected infection.
    pub variant: Option<usize>,
}

impl Agent {
    pub fn new(id: usize, n_targets: usize) -> Self {
        Self {
            id,
            targets: vec![TargetState::default(); n_targets],
            doses: 0,
            vacc_day: None,
            confirmed: false,
            active: false,
            recovered: false,
            rec_day: None,
            conf_day: None,
            variant: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_immune(&self, target: usize) -> bool {
        self.targets[target].immune
    }

    /// Schedule immunity against `target` from `imm_day` until `loss_day`.
    ///
    /// A pending loss is only ever postponed, never brought forward.
    pub fn schedule_immunity(&mut self, target: usize, imm_day: usize, loss_day: usize) {
        let state = &mut self.targets[target];
        state.imm_day = Some(imm_day);
        state.loss_day = Some(state.loss_day.map_or(loss_day, |day| day.max(loss_day)));
    }

    /// Apply the state changes due on `day`.
    pub fn realize(&mut self, day: usize) {
        for state in &mut self.targets {
            if state.imm_day == Some(day) {
                state.imm_day = None;
                state.immune = true;
            }
            if state.loss_day == Some(day) {
                state.loss_day = None;
                state.immune = false;
            }
        }
        if self.rec_day == Some(day) {
            self.rec_day = None;
            self.active = false;
            self.recovered = true;
        }
        if self.conf_day == Some(day) {
            self.conf_day = None;
            self.confirmed = true;
        }
    }

    /// Aggregation bucket of the agent, `None` if never infected nor vaccinated.
    pub fn bucket(&self) -> Option<Bucket> {
        let bucket = match (self.active, self.doses > 0, self.recovered, self.confirmed) {
            (true, _, _, true) => Bucket::ActiveDetected,
            (true, _, _, false) => Bucket::ActiveUndetected,
            (false, true, false, _) => Bucket::Vaccinated,
            (false, true, true, true) => Bucket::VaccinatedRecoveredDetected,
            (false, true, true, false) => Bucket::VaccinatedRecoveredUndetected,
            (false, false, true, true) => Bucket::RecoveredDetected,
            (false, false, true, false) => Bucket::RecoveredUndetected,
            (false, false, false, _) => return None,
        };
        Some(bucket)
    }
}

/// Mutually exclusive classes of agents counted every day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    ActiveDetected,
    ActiveUndetected,
    Vaccinated,
    VaccinatedRecoveredDetected,
    VaccinatedRecoveredUndetected,
    RecoveredDetected,
    RecoveredUndetected,
}

impl Bucket {
    pub const COUNT: usize = 7;

    pub const ALL: [Bucket; Self::COUNT] = [
        Self::ActiveDetected,
        Self::ActiveUndetected,
        Self::Vaccinated,
        Self::VaccinatedRecoveredDetected,
        Self::VaccinatedRecoveredUndetected,
        Self::RecoveredDetected,
        Self::RecoveredUndetected,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Series name prefix of the bucket.
    pub fn label(self) -> &'static str {
        match self {
            Self::ActiveDetected => "active detected",
            Self::ActiveUndetected => "active undetected",
            Self::Vaccinated => "vaccinated",
            Self::VaccinatedRecoveredDetected => "past detected + vaccinated",
            Self::VaccinatedRecoveredUndetected => "past undetected + vaccinated",
            Self::RecoveredDetected => "past detected",
            Self::RecoveredUndetected => "past undetected",
        }
    }
}

/// Fixed set of agents visited in a fresh random order every day.
#[derive(Debug, Clone)]
pub struct Population {
    agents: Vec<Agent>,
    order: Vec<usize>,
}

impl Population {
    pub fn new(n_agents: usize, n_targets: usize) -> Self {
        Self {
            agents: (0..n_agents).map(|id| Agent::new(id, n_targets)).collect(),
            order: (0..n_agents).collect(),
        }
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Shuffle the visiting order, then visit every agent once.
    pub fn visit_shuffled<R, F>(&mut self, rng: &mut R, mut visit: F)
    where
        R: Rng + ?Sized,
        F: FnMut(&mut Agent, &mut R),
    {
        self.order.shuffle(rng);
        for &i_agt in &self.order {
            visit(&mut self.agents[i_agt], rng);
        }
    }
}
