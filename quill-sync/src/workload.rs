//! Randomized word-level edit workload and the convergence check.
//!
//! Text is treated as words separated by single spaces. Each tick a replica
//! either gains one vocabulary word at a random word boundary or loses the
//! word at a random position, with equal probability.

use rand::Rng;

/// Vocabulary the generator draws insertions from.
pub const WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing",
    "elit", "nullam", "sit", "amet", "nulla", "non", "est", "finibus",
    "mollis", "nulla", "in", "felis", "eu", "felis", "vehicula", "viverra",
    "id", "lobortis", "massa", "aliquam", "mi", "dolor", "aliquet", "a",
    "volutpat", "vitae", "porta", "tempor", "eros", "vestibulum", "sit",
    "amet", "commodo", "ex", "vestibulum", "ante", "ipsum", "primis", "in",
    "faucibus", "orci", "luctus", "et", "ultrices", "posuere", "cubilia", "curae",
    "in", "dapibus", "sollicitudin", "est", "vel", "convallis", "class", "aptent",
    "taciti", "sociosqu", "ad", "litora", "torquent", "per", "conubia", "nostra",
    "per", "inceptos", "himenaeos",
];

/// Workload settings.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of replicas editing the document
    pub replicas: usize,
    /// Wall-clock tick period for live runs
    pub tick_interval_ms: u64,
    /// Document every replica opens
    pub doc_id: String,
    /// Seed for reproducible runs (None = entropy)
    pub seed: Option<u64>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            tick_interval_ms: 500,
            doc_id: "DOC0".to_string(),
            seed: None,
        }
    }
}

fn words(text: &str) -> Vec<&str> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split(' ').collect()
    }
}

/// Insert a random vocabulary word at a random word boundary.
pub fn add_word<R: Rng + ?Sized>(text: &str, rng: &mut R) -> String {
    let mut words = words(text);
    let word = WORDS[rng.gen_range(0..WORDS.len())];
    let at = rng.gen_range(0..=words.len());
    words.insert(at, word);
    words.join(" ")
}

/// Remove the word at a random position. Empty text stays empty.
pub fn delete_word<R: Rng + ?Sized>(text: &str, rng: &mut R) -> String {
    let mut words = words(text);
    if words.is_empty() {
        return String::new();
    }
    let at = rng.gen_range(0..words.len());
    words.remove(at);
    words.join(" ")
}

/// One random edit: insert or delete with equal probability.
pub fn adjust<R: Rng + ?Sized>(text: &str, rng: &mut R) -> String {
    if rng.gen_bool(0.5) {
        add_word(text, rng)
    } else {
        delete_word(text, rng)
    }
}

/// Logical clock driving the generator.
///
/// Ticks only count while the scheduler is running, so callers can pause
/// edit generation without stopping message delivery. A scheduler with a
/// limit stops itself once that many ticks have run.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    ticks: u64,
    running: bool,
    limit: Option<u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: u64) -> Self {
        Self { limit: Some(limit), ..Self::default() }
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Advance one tick. Returns whether edits should be generated.
    pub fn tick(&mut self) -> bool {
        if self.limit.is_some_and(|limit| self.ticks >= limit) {
            self.running = false;
        }
        if self.running {
            self.ticks += 1;
        }
        self.running
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

/// Point-in-time agreement between replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceReport {
    Synchronized(String),
    /// Every replica's state, in replica order.
    NotSynchronized(Vec<String>),
}

impl ConvergenceReport {
    pub fn is_synchronized(&self) -> bool {
        matches!(self, Self::Synchronized(_))
    }
}

impl std::fmt::Display for ConvergenceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synchronized(text) => write!(f, "synchronized as: {text}"),
            Self::NotSynchronized(states) => {
                write!(f, "not yet synchronized:")?;
                for state in states {
                    write!(f, "\n{state}")?;
                }
                Ok(())
            }
        }
    }
}

/// Compare replica states for exact equality. No replicas counts as agreement.
pub fn check_convergence<S: AsRef<str>>(states: &[S]) -> ConvergenceReport {
    match states.split_first() {
        None => ConvergenceReport::Synchronized(String::new()),
        Some((first, rest)) if rest.iter().all(|s| s.as_ref() == first.as_ref()) => {
            ConvergenceReport::Synchronized(first.as_ref().to_string())
        }
        Some(_) => ConvergenceReport::NotSynchronized(
            states.iter().map(|s| s.as_ref().to_string()).collect(),
        ),
    }
}
