/// Candidate generation
///
/// Produces the identifiers to probe. The upstream service has no listing
/// endpoint, so the id space is searched with three strategies:
///
///   range   - every `step`-th id of a declared numeric sub-range, ascending,
///             resuming from a cursor persisted in the store
///   pattern - unseen ids that share stems, endings and digit frequencies
///             with the gauges found so far
///   cluster - a symmetric ±radius window around every found gauge
///
/// Strategies are composed by weighted round-robin. Identifiers the store has
/// already seen are never handed out again, except TRANSIENT_ERROR entries
/// whose TTL has expired; those are re-emitted ahead of fresh candidates.
///
/// Given the same store contents and configuration, the emitted sequence is
/// always the same.

use super::store::DiscoveryStore;
use crate::config::{GeneratorConfig, StrategyConfig};
use crate::logging::{self, LogSource};
use crate::model::{Candidate, StrategyKind};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Identifier layout
// ---------------------------------------------------------------------------

/// An identifier split into its alphabetic prefix and zero-padded numeric
/// tail, e.g. `hybas_4120570410` -> ("hybas_", 4120570410, width 10).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdPattern {
    pub prefix: String,
    pub value: u64,
    pub width: usize,
}

impl IdPattern {
    pub fn parse(id: &str) -> Option<Self> {
        let digits_start = id
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i)?;
        let digits = &id[digits_start..];
        if digits.len() > 19 {
            return None;
        }
        Some(Self {
            prefix: id[..digits_start].to_string(),
            value: digits.parse().ok()?,
            width: digits.len(),
        })
    }

    pub fn format(prefix: &str, value: u64, width: usize) -> String {
        format!("{}{:0width$}", prefix, value, width = width)
    }

    /// Same layout, different number. `None` if it no longer fits the width.
    pub fn with_value(&self, value: u64) -> Option<String> {
        (value.to_string().len() <= self.width).then(|| Self::format(&self.prefix, value, self.width))
    }
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

pub trait CandidateStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Stable name, also used as the cursor key in the store.
    fn name(&self) -> &str;

    /// Next identifier the store has never seen, or `None` if the strategy
    /// has nothing left given the current store contents.
    fn next_id(&mut self, store: &DiscoveryStore) -> Option<String>;

    /// Persist resumable position, if the strategy has one.
    fn checkpoint(&mut self, _store: &DiscoveryStore) {}
}

// ---------------------------------------------------------------------------
// Range
// ---------------------------------------------------------------------------

pub struct RangeStrategy {
    name: String,
    prefix: String,
    width: usize,
    start: u64,
    end: u64,
    step: u64,
    /// Next value to consider; `None` until loaded from the store cursor.
    position: Option<u64>,
    /// Handed out but not yet recorded in the store.
    outstanding: BTreeSet<u64>,
}

impl RangeStrategy {
    pub fn new(prefix: &str, width: usize, start: u64, end: u64, step: u64) -> Self {
        Self {
            name: format!("range:{}{}-{}", prefix, start, end),
            prefix: prefix.to_string(),
            width,
            start,
            end,
            step: step.max(1),
            position: None,
            outstanding: BTreeSet::new(),
        }
    }

    fn load_position(&mut self, store: &DiscoveryStore) -> u64 {
        *self.position.get_or_insert_with(|| {
            let cursor = store.cursor(&self.name).unwrap_or(self.start);
            // Snap onto the step grid.
            let offset = cursor.saturating_sub(self.start);
            self.start + offset.div_ceil(self.step) * self.step
        })
    }
}

impl CandidateStrategy for RangeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Range
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn next_id(&mut self, store: &DiscoveryStore) -> Option<String> {
        let mut value = self.load_position(store);
        while value <= self.end {
            let id = IdPattern::format(&self.prefix, value, self.width);
            let next = value.checked_add(self.step);
            self.position = Some(next.unwrap_or(u64::MAX));
            if !store.has_been_probed(&id) {
                self.outstanding.insert(value);
                return Some(id);
            }
            value = next?;
        }
        None
    }

    /// The cursor is the smallest value not yet recorded, so a resumed run
    /// re-issues anything that was handed out but never finished.
    fn checkpoint(&mut self, store: &DiscoveryStore) {
        let Some(position) = self.position else {
            return;
        };
        self.outstanding
            .retain(|v| !store.has_been_probed(&IdPattern::format(&self.prefix, *v, self.width)));
        let cursor = self
            .outstanding
            .first()
            .copied()
            .unwrap_or(position)
            .min(position);
        store.set_cursor(&self.name, cursor);
    }
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// Ids of one (prefix, width) family, enumerated as
/// ending-major, then stem, then middle.
#[derive(Debug)]
struct PatternFamily {
    prefix: String,
    width: usize,
    stems: Vec<u64>,
    middles: Vec<u64>,
    endings: Vec<u64>,
}

impl PatternFamily {
    fn len(&self) -> usize {
        self.stems.len() * self.middles.len() * self.endings.len()
    }

    fn id_at(&self, index: usize, varying_digits: u32) -> String {
        let per_ending = self.stems.len() * self.middles.len();
        let ending = self.endings[index / per_ending];
        let rest = index % per_ending;
        let stem = self.stems[rest / self.middles.len()];
        let middle = self.middles[rest % self.middles.len()];
        let value = stem * 10u64.pow(varying_digits) + middle * 100 + ending;
        IdPattern::format(&self.prefix, value, self.width)
    }
}

pub struct PatternStrategy {
    prefix: Option<String>,
    varying_digits: u32,
    top_endings: usize,
    families: Vec<PatternFamily>,
    family_idx: usize,
    index: usize,
    /// Found count the current plan was built from.
    built_from: Option<usize>,
}

impl PatternStrategy {
    pub fn new(prefix: Option<String>, varying_digits: u32, top_endings: usize) -> Self {
        Self {
            prefix,
            varying_digits: varying_digits.clamp(2, 6),
            top_endings: top_endings.max(1),
            families: Vec::new(),
            family_idx: 0,
            index: 0,
            built_from: None,
        }
    }

    fn rebuild(&mut self, store: &DiscoveryStore) {
        let v = self.varying_digits;
        let stem_div = 10u64.pow(v);
        let middle_digits = (v - 2) as usize;
        let middle_space = 10u64.pow(v - 2);

        let mut grouped: BTreeMap<(String, usize), Vec<u64>> = BTreeMap::new();
        for id in store.found_ids() {
            let Some(p) = IdPattern::parse(&id) else { continue };
            if self.prefix.as_deref().is_some_and(|want| want != p.prefix) {
                continue;
            }
            if p.width <= v as usize {
                continue;
            }
            grouped.entry((p.prefix, p.width)).or_default().push(p.value);
        }

        self.families = grouped
            .into_iter()
            .map(|((prefix, width), values)| {
                let stems: BTreeSet<u64> = values.iter().map(|n| n / stem_div).collect();

                let mut ending_counts: BTreeMap<u64, usize> = BTreeMap::new();
                for n in &values {
                    *ending_counts.entry(n % 100).or_default() += 1;
                }
                let mut endings: Vec<(u64, usize)> = ending_counts.into_iter().collect();
                endings.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                endings.truncate(self.top_endings);

                // Positional digit frequencies of the middle section.
                let mut freq = vec![[0usize; 10]; middle_digits];
                for n in &values {
                    let mut middle = (n / 100) % middle_space;
                    for pos in (0..middle_digits).rev() {
                        freq[pos][(middle % 10) as usize] += 1;
                        middle /= 10;
                    }
                }
                let score = |mut m: u64| -> usize {
                    let mut total = 0;
                    for pos in (0..middle_digits).rev() {
                        total += freq[pos][(m % 10) as usize];
                        m /= 10;
                    }
                    total
                };
                let mut middles: Vec<(u64, usize)> =
                    (0..middle_space).map(|m| (m, score(m))).collect();
                middles.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

                PatternFamily {
                    prefix,
                    width,
                    stems: stems.into_iter().collect(),
                    middles: middles.into_iter().map(|(m, _)| m).collect(),
                    endings: endings.into_iter().map(|(e, _)| e).collect(),
                }
            })
            .collect();

        self.family_idx = 0;
        self.index = 0;
        self.built_from = Some(store.found_count());

        logging::debug(
            LogSource::Generator,
            None,
            &format!(
                "Pattern plan rebuilt: {} families, {} candidates",
                self.families.len(),
                self.families.iter().map(|f| f.len()).sum::<usize>()
            ),
        );
    }
}

impl CandidateStrategy for PatternStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Pattern
    }

    fn name(&self) -> &str {
        "pattern"
    }

    fn next_id(&mut self, store: &DiscoveryStore) -> Option<String> {
        if self.built_from.is_none() {
            self.rebuild(store);
        }
        loop {
            while let Some(family) = self.families.get(self.family_idx) {
                if self.index >= family.len() {
                    self.family_idx += 1;
                    self.index = 0;
                    continue;
                }
                let id = family.id_at(self.index, self.varying_digits);
                self.index += 1;
                if !store.has_been_probed(&id) {
                    return Some(id);
                }
            }
            if self.built_from == Some(store.found_count()) {
                return None;
            }
            self.rebuild(store);
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

pub struct ClusterStrategy {
    radius: u64,
    step: u64,
    seeds: Vec<IdPattern>,
    seen: HashSet<String>,
    seed_idx: usize,
    offset_idx: u64,
}

impl ClusterStrategy {
    pub fn new(radius: u64, step: u64) -> Self {
        Self {
            radius,
            step: step.max(1),
            seeds: Vec::new(),
            seen: HashSet::new(),
            seed_idx: 0,
            offset_idx: 0,
        }
    }

    fn offsets_per_seed(&self) -> u64 {
        2 * (self.radius / self.step)
    }

    /// Append found gauges that are not yet seeds, in identifier order.
    fn extend_seeds(&mut self, store: &DiscoveryStore) -> bool {
        let before = self.seeds.len();
        for id in store.found_ids() {
            if self.seen.insert(id.clone()) {
                if let Some(pattern) = IdPattern::parse(&id) {
                    self.seeds.push(pattern);
                }
            }
        }
        self.seeds.len() > before
    }
}

impl CandidateStrategy for ClusterStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Cluster
    }

    fn name(&self) -> &str {
        "cluster"
    }

    fn next_id(&mut self, store: &DiscoveryStore) -> Option<String> {
        let per_seed = self.offsets_per_seed();
        loop {
            if self.seed_idx >= self.seeds.len() && !self.extend_seeds(store) {
                return None;
            }
            let seed = &self.seeds[self.seed_idx];
            if self.offset_idx >= per_seed {
                self.seed_idx += 1;
                self.offset_idx = 0;
                continue;
            }

            // -step, +step, -2*step, +2*step, ...
            let distance = (self.offset_idx / 2 + 1) * self.step;
            let value = if self.offset_idx % 2 == 0 {
                seed.value.checked_sub(distance)
            } else {
                seed.value.checked_add(distance)
            };
            self.offset_idx += 1;

            if let Some(id) = value.and_then(|v| seed.with_value(v)) {
                if !store.has_been_probed(&id) {
                    return Some(id);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Composite generator
// ---------------------------------------------------------------------------

struct WeightedStrategy {
    strategy: Box<dyn CandidateStrategy>,
    weight: u32,
}

pub struct CandidateGenerator {
    store: Arc<DiscoveryStore>,
    strategies: Vec<WeightedStrategy>,
    turn: usize,
    credit: u32,
    /// Attempt number each identifier was last handed out with.
    emitted: HashMap<String, u32>,
    retry_queue: VecDeque<(String, StrategyKind)>,
}

impl CandidateGenerator {
    pub fn new(store: Arc<DiscoveryStore>) -> Self {
        Self {
            store,
            strategies: Vec::new(),
            turn: 0,
            credit: 0,
            emitted: HashMap::new(),
            retry_queue: VecDeque::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn CandidateStrategy>, weight: u32) -> Self {
        self.strategies.push(WeightedStrategy {
            strategy,
            weight: weight.max(1),
        });
        self
    }

    pub fn from_config(config: &GeneratorConfig, store: Arc<DiscoveryStore>) -> Self {
        config
            .strategies
            .iter()
            .fold(Self::new(store), |generator, cfg| {
                let strategy: Box<dyn CandidateStrategy> = match cfg {
                    StrategyConfig::Range {
                        prefix,
                        width,
                        start,
                        end,
                        step,
                        ..
                    } => Box::new(RangeStrategy::new(prefix, *width, *start, *end, *step)),
                    StrategyConfig::Pattern {
                        prefix,
                        varying_digits,
                        top_endings,
                        ..
                    } => Box::new(PatternStrategy::new(
                        prefix.clone(),
                        *varying_digits,
                        *top_endings,
                    )),
                    StrategyConfig::Cluster { radius, step, .. } => {
                        Box::new(ClusterStrategy::new(*radius, *step))
                    }
                };
                generator.with_strategy(strategy, cfg.weight())
            })
    }

    pub fn store(&self) -> &Arc<DiscoveryStore> {
        &self.store
    }

    pub fn next_candidate(&mut self) -> Option<Candidate> {
        self.next_candidate_at(Utc::now())
    }

    /// Next candidate as of `now`: expired TRANSIENT_ERROR retries first,
    /// then fresh ids by weighted round-robin.
    pub fn next_candidate_at(&mut self, now: DateTime<Utc>) -> Option<Candidate> {
        if let Some(candidate) = self.next_retry(now) {
            return Some(candidate);
        }

        let n = self.strategies.len();
        for _ in 0..(2 * n) {
            if self.credit == 0 {
                self.credit = self.strategies[self.turn].weight;
            }
            let store = Arc::clone(&self.store);
            let slot = &mut self.strategies[self.turn];
            let kind = slot.strategy.kind();

            let mut picked = None;
            while let Some(id) = slot.strategy.next_id(&store) {
                if !is_in_flight(&self.emitted, &store, &id) {
                    picked = Some(id);
                    break;
                }
            }

            match picked {
                Some(id) => {
                    self.credit -= 1;
                    if self.credit == 0 {
                        self.turn = (self.turn + 1) % n;
                    }
                    return Some(self.emit(id, kind));
                }
                None => {
                    self.credit = 0;
                    self.turn = (self.turn + 1) % n;
                }
            }
        }
        None
    }

    fn next_retry(&mut self, now: DateTime<Utc>) -> Option<Candidate> {
        if self.retry_queue.is_empty() {
            self.retry_queue.extend(self.store.due_retries_at(now));
        }
        while let Some((id, kind)) = self.retry_queue.pop_front() {
            if self.store.is_eligible_at(&id, now) && !is_in_flight(&self.emitted, &self.store, &id) {
                logging::debug(
                    LogSource::Generator,
                    Some(&id),
                    "Re-emitting after transient error TTL",
                );
                return Some(self.emit(id, kind));
            }
        }
        None
    }

    fn emit(&mut self, gauge_id: String, strategy: StrategyKind) -> Candidate {
        let attempt = self.store.attempts(&gauge_id) + 1;
        self.emitted.insert(gauge_id.clone(), attempt);
        Candidate {
            gauge_id,
            strategy,
            attempt,
        }
    }

    /// Persist strategy cursors and forget identifiers that have landed in
    /// the store.
    pub fn checkpoint(&mut self) {
        for slot in &mut self.strategies {
            slot.strategy.checkpoint(&self.store);
        }
        let store = &self.store;
        self.emitted.retain(|id, attempt| store.attempts(id) < *attempt);
    }
}

fn is_in_flight(emitted: &HashMap<String, u32>, store: &DiscoveryStore, id: &str) -> bool {
    emitted
        .get(id)
        .is_some_and(|attempt| store.attempts(id) < *attempt)
}

impl Iterator for CandidateGenerator {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        self.next_candidate()
    }
}
