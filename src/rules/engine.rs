//! Rule evaluation engine.
//!
//! Rules are evaluated when a change event arrives for any tag referenced by
//! their conditions, so rule latency is bounded by poll latency with no
//! second polling cadence. Debounce and cooldown are explicit next-eligible instants
//! checked against the monotonic clock on every evaluation; a single deferred
//! wake-up timer covers pending deadlines, so evaluation stays deterministic
//! and unit-testable under a paused clock.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, warn};

use crate::core::error::{GatewayError, Result};
use crate::core::event::ChangeEvent;
use crate::core::value::Value;
use crate::store::CurrentValueTable;

use super::action::{send_webhook, Action, PushStatus, TemplateContext};
use super::condition::{combine, Condition, LogicMode};

/// Runtime state of one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    /// Waiting for the condition set to become satisfied.
    Armed,
    /// Conditions satisfied, actions dispatching.
    Firing,
    /// Fired; waiting for the condition set to clear before re-arming.
    WaitingClear,
    /// Fired; re-fire gated by the cooldown interval.
    Cooldown,
    /// Every fire action failed on the last fire.
    Error,
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Armed => "Armed",
            Self::Firing => "Firing",
            Self::WaitingClear => "WaitingClear",
            Self::Cooldown => "Cooldown",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Cooldown scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownMode {
    /// One interval for the whole rule.
    #[default]
    Global,
    /// Each condition re-fires on its own cadence. The rule re-arms
    /// immediately after a fire; a condition inside its cooldown window
    /// evaluates as unsatisfied. Cleared actions do not apply in this mode.
    PerCondition,
}

/// Rule definition as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name, unique within the gateway.
    pub name: String,

    /// Whether the rule is evaluated at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ordered condition list.
    pub conditions: Vec<Condition>,

    /// AND/OR combination mode.
    #[serde(default)]
    pub logic: LogicMode,

    /// The condition set must hold continuously this long before firing.
    #[serde(default)]
    pub debounce_ms: u64,

    /// Minimum interval between fires.
    #[serde(default)]
    pub cooldown_ms: u64,

    /// Cooldown scope.
    #[serde(default)]
    pub cooldown_mode: CooldownMode,

    /// Actions dispatched on fire.
    pub actions: Vec<Action>,

    /// Actions dispatched on the transition back to `Armed`.
    #[serde(default)]
    pub cleared_actions: Vec<Action>,
}

fn default_true() -> bool {
    true
}

impl RuleConfig {
    /// Validate configuration-level constraints.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatewayError::Config("rule name is empty".to_string()));
        }
        if self.conditions.is_empty() {
            return Err(GatewayError::Config(format!(
                "rule {} has no conditions",
                self.name
            )));
        }
        if self.actions.is_empty() {
            return Err(GatewayError::Config(format!(
                "rule {} has no actions",
                self.name
            )));
        }
        for action in self.actions.iter().chain(&self.cleared_actions) {
            action.validate()?;
        }
        Ok(())
    }
}

/// Observable status of one rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub name: String,
    pub enabled: bool,
    pub state: RuleState,
    pub fire_count: u64,
    pub last_fire: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Webhook delivery statistics, one entry per fire action (non-webhook
    /// actions keep a zeroed entry so indices line up with the config).
    pub pushes: Vec<PushStatus>,
}

/// Gateway operations a firing rule may invoke.
///
/// Implemented by the connection manager; the engine never reaches into
/// manager internals.
#[async_trait]
pub trait RuleHost: Send + Sync {
    /// Write a value back to a controller tag. Subject to the same
    /// connectivity failure semantics as manual writes.
    async fn write_tag(&self, device: &str, tag: &str, value: &Value) -> Result<()>;

    /// Force an out-of-band publish of a tag's current value.
    async fn force_publish(&self, device: &str, tag: &str) -> Result<()>;
}

struct RuleRuntime {
    config: RuleConfig,
    state: RuleState,
    satisfied_since: Option<Instant>,
    next_eligible: Option<Instant>,
    condition_eligible: Vec<Option<Instant>>,
    action_eligible: Vec<Option<Instant>>,
    cleared_action_eligible: Vec<Option<Instant>>,
    fire_count: u64,
    last_fire: Option<DateTime<Utc>>,
    last_error: Option<String>,
    push_status: Vec<PushStatus>,
    cleared_push_status: Vec<PushStatus>,
}

impl RuleRuntime {
    fn new(config: RuleConfig) -> Self {
        let conditions = config.conditions.len();
        let actions = config.actions.len();
        let cleared = config.cleared_actions.len();
        Self {
            config,
            state: RuleState::Armed,
            satisfied_since: None,
            next_eligible: None,
            condition_eligible: vec![None; conditions],
            action_eligible: vec![None; actions],
            cleared_action_eligible: vec![None; cleared],
            fire_count: 0,
            last_fire: None,
            last_error: None,
            push_status: vec![PushStatus::default(); actions],
            cleared_push_status: vec![PushStatus::default(); cleared],
        }
    }

    fn references(&self, device: &str, tag: &str) -> bool {
        self.config
            .conditions
            .iter()
            .any(|c| c.device == device && c.tag == tag)
    }

    fn status(&self) -> RuleStatus {
        RuleStatus {
            name: self.config.name.clone(),
            enabled: self.config.enabled,
            state: self.state,
            fire_count: self.fire_count,
            last_fire: self.last_fire,
            last_error: self.last_error.clone(),
            pushes: self.push_status.clone(),
        }
    }
}

enum PlanKind {
    Fire { satisfied: Vec<usize> },
    Clear,
    Manual,
}

struct Plan {
    rule_name: String,
    kind: PlanKind,
    /// `(action index, action)` pairs eligible for dispatch.
    actions: Vec<(usize, Action)>,
    ctx: TemplateContext,
}

struct EngineInner {
    values: Arc<CurrentValueTable>,
    host: Arc<dyn RuleHost>,
    http: reqwest::Client,
    rules: Mutex<Vec<RuleRuntime>>,
    wake: tokio::sync::Notify,
}

/// The rule/condition engine.
#[derive(Clone)]
pub struct RuleEngine {
    inner: Arc<EngineInner>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RuleEngine {
    /// Create an engine over the shared value table and a host.
    pub fn new(values: Arc<CurrentValueTable>, host: Arc<dyn RuleHost>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                values,
                host,
                http: reqwest::Client::new(),
                rules: Mutex::new(Vec::new()),
                wake: tokio::sync::Notify::new(),
            }),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Add a rule. Rejected synchronously on invalid or duplicate config.
    pub fn add_rule(&self, config: RuleConfig) -> Result<()> {
        config.validate()?;
        let mut rules = self.inner.rules.lock().expect("lock poisoned");
        if rules.iter().any(|r| r.config.name == config.name) {
            return Err(GatewayError::Config(format!(
                "duplicate rule: {}",
                config.name
            )));
        }
        rules.push(RuleRuntime::new(config));
        drop(rules);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Remove a rule by name.
    pub fn remove_rule(&self, name: &str) -> Result<()> {
        let mut rules = self.inner.rules.lock().expect("lock poisoned");
        let before = rules.len();
        rules.retain(|r| r.config.name != name);
        if rules.len() == before {
            return Err(GatewayError::Config(format!("unknown rule: {}", name)));
        }
        Ok(())
    }

    /// Enable or disable a rule. Re-enabling re-arms it.
    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut rules = self.inner.rules.lock().expect("lock poisoned");
        let rule = rules
            .iter_mut()
            .find(|r| r.config.name == name)
            .ok_or_else(|| GatewayError::Config(format!("unknown rule: {}", name)))?;
        rule.config.enabled = enabled;
        if enabled {
            rule.state = RuleState::Armed;
            rule.satisfied_since = None;
        }
        drop(rules);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Status of one rule.
    pub fn status(&self, name: &str) -> Option<RuleStatus> {
        self.inner
            .rules
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|r| r.config.name == name)
            .map(RuleRuntime::status)
    }

    /// Status of every rule.
    pub fn statuses(&self) -> Vec<RuleStatus> {
        self.inner
            .rules
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(RuleRuntime::status)
            .collect()
    }

    /// Manually fire a rule, bypassing condition evaluation.
    ///
    /// Exercises the same action-dispatch and status-tracking path as a real
    /// fire; the evaluation state machine is left untouched so a test fire
    /// cannot wedge a rule mid-debounce.
    pub async fn fire_now(&self, name: &str) -> Result<()> {
        let now = Instant::now();
        let plan = {
            let mut rules = self.inner.rules.lock().expect("lock poisoned");
            let rule = rules
                .iter_mut()
                .find(|r| r.config.name == name)
                .ok_or_else(|| GatewayError::Config(format!("unknown rule: {}", name)))?;
            build_plan(&self.inner.values, rule, PlanKind::Manual, now)
        };
        dispatch(&self.inner, plan, now).await;
        Ok(())
    }

    /// Start consuming change events from a listener channel.
    pub fn attach(&self, rx: mpsc::Receiver<ChangeEvent>) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_engine(inner, rx));
        *self.task.lock().expect("lock poisoned") = Some(handle);
    }

    /// Stop the evaluation task.
    pub fn shutdown(&self) {
        if let Some(handle) = self.task.lock().expect("lock poisoned").take() {
            handle.abort();
        }
    }
}

/// Engine task: event-driven evaluation plus one deadline timer.
async fn run_engine(inner: Arc<EngineInner>, mut rx: mpsc::Receiver<ChangeEvent>) {
    loop {
        let deadline = next_deadline(&inner);
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(event) => {
                        evaluate(&inner, Some((event.device.as_str(), event.tag.as_str()))).await;
                    }
                    None => break,
                }
            }
            _ = inner.wake.notified() => {
                evaluate(&inner, None).await;
            }
            _ = wait_until(deadline) => {
                evaluate(&inner, None).await;
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Earliest pending debounce/cooldown deadline across all rules.
fn next_deadline(inner: &EngineInner) -> Option<Instant> {
    let rules = inner.rules.lock().expect("lock poisoned");
    let mut earliest: Option<Instant> = None;
    let mut push = |candidate: Option<Instant>| {
        if let Some(c) = candidate {
            earliest = Some(match earliest {
                Some(e) if e <= c => e,
                _ => c,
            });
        }
    };

    for rule in rules.iter() {
        if !rule.config.enabled {
            continue;
        }
        // A pending debounce matures at satisfied_since + debounce, but not
        // before the global cooldown gate opens.
        if let Some(since) = rule.satisfied_since {
            let mut due = since + Duration::from_millis(rule.config.debounce_ms);
            if let Some(gate) = rule.next_eligible {
                if gate > due {
                    due = gate;
                }
            }
            push(Some(due));
        }
        if rule.state == RuleState::Cooldown {
            push(rule.next_eligible);
        }
        for instant in rule.condition_eligible.iter().flatten() {
            push(Some(*instant));
        }
    }
    earliest
}

/// Evaluate rules (optionally only those referencing one tag) and dispatch
/// whatever fired or cleared.
async fn evaluate(inner: &Arc<EngineInner>, changed: Option<(&str, &str)>) {
    let now = Instant::now();
    let plans = {
        let mut rules = inner.rules.lock().expect("lock poisoned");
        let mut plans = Vec::new();
        for index in 0..rules.len() {
            if let Some((device, tag)) = changed {
                // Timers and wake-ups re-check everything; a change event
                // only re-checks rules that reference the changed tag.
                if !rules[index].references(device, tag) && !has_pending_deadline(&rules[index], now)
                {
                    continue;
                }
            }
            if let Some(kind) = transition(&inner.values, &mut rules[index], now) {
                let plan = build_plan(&inner.values, &mut rules[index], kind, now);
                plans.push(plan);
            }
        }
        plans
    };

    for plan in plans {
        dispatch(inner, plan, now).await;
    }
}

fn has_pending_deadline(rule: &RuleRuntime, now: Instant) -> bool {
    rule.satisfied_since.is_some()
        || rule.next_eligible.map_or(false, |t| t <= now)
        || rule
            .condition_eligible
            .iter()
            .flatten()
            .any(|t| *t <= now)
}

/// Gated satisfaction: a condition inside its per-condition cooldown window
/// evaluates as unsatisfied. Expired windows are cleared here so the
/// deadline timer never re-arms on a stale instant.
fn satisfied(
    values: &CurrentValueTable,
    rule: &mut RuleRuntime,
    now: Instant,
) -> (bool, Vec<usize>) {
    let per_condition = rule.config.cooldown_mode == CooldownMode::PerCondition;
    let RuleRuntime {
        config,
        condition_eligible,
        ..
    } = rule;

    let mut hits = Vec::new();
    let mut results = Vec::with_capacity(config.conditions.len());
    for (i, c) in config.conditions.iter().enumerate() {
        if per_condition {
            match condition_eligible[i] {
                Some(gate) if now < gate => {
                    results.push(false);
                    continue;
                }
                Some(_) => condition_eligible[i] = None,
                None => {}
            }
        }
        let hit = values
            .get(&c.device, &c.tag)
            .map(|v| c.matches(&v))
            .unwrap_or(false);
        if hit {
            hits.push(i);
        }
        results.push(hit);
    }
    (combine(config.logic, results), hits)
}

/// Advance one rule's state machine; returns a dispatch kind on transition.
fn transition(values: &CurrentValueTable, rule: &mut RuleRuntime, now: Instant) -> Option<PlanKind> {
    if !rule.config.enabled {
        return None;
    }
    let (is_satisfied, hits) = satisfied(values, rule, now);

    match rule.state {
        RuleState::Armed => {
            if !is_satisfied {
                rule.satisfied_since = None;
                return None;
            }
            let since = *rule.satisfied_since.get_or_insert(now);
            let held = now.duration_since(since);
            let debounce = Duration::from_millis(rule.config.debounce_ms);
            let eligible = match rule.next_eligible {
                Some(gate) if now < gate => false,
                Some(_) => {
                    rule.next_eligible = None;
                    true
                }
                None => true,
            };
            if held >= debounce && eligible {
                rule.state = RuleState::Firing;
                return Some(PlanKind::Fire { satisfied: hits });
            }
            None
        }
        RuleState::Firing => None,
        RuleState::WaitingClear | RuleState::Error => {
            if !is_satisfied {
                rule.state = RuleState::Armed;
                rule.satisfied_since = None;
                return Some(PlanKind::Clear);
            }
            None
        }
        RuleState::Cooldown => {
            if !is_satisfied {
                rule.state = RuleState::Armed;
                rule.satisfied_since = None;
                return Some(PlanKind::Clear);
            }
            let eligible = rule.next_eligible.map_or(true, |t| now >= t);
            if eligible {
                // Conditions held through the whole cooldown: re-fire.
                rule.state = RuleState::Firing;
                return Some(PlanKind::Fire { satisfied: hits });
            }
            None
        }
    }
}

/// Collect the eligible actions for a transition, applying per-action
/// webhook cooldowns, and snapshot the template context.
fn build_plan(
    values: &CurrentValueTable,
    rule: &mut RuleRuntime,
    kind: PlanKind,
    now: Instant,
) -> Plan {
    let cleared = matches!(kind, PlanKind::Clear);
    let (source, eligibility): (&[Action], &mut Vec<Option<Instant>>) = if cleared {
        (
            &rule.config.cleared_actions,
            &mut rule.cleared_action_eligible,
        )
    } else {
        (&rule.config.actions, &mut rule.action_eligible)
    };

    let mut actions = Vec::with_capacity(source.len());
    for (i, action) in source.iter().enumerate() {
        if let Action::Webhook(w) = action {
            if let Some(eligible) = eligibility[i] {
                if now < eligible {
                    debug!(rule = rule.config.name.as_str(), action = i, "webhook in cooldown, skipped");
                    continue;
                }
            }
            if w.cooldown_ms > 0 {
                eligibility[i] = Some(now + Duration::from_millis(w.cooldown_ms));
            }
        }
        actions.push((i, action.clone()));
    }

    // Template context: the first condition's tag and its current value.
    let first = &rule.config.conditions[0];
    let value = values
        .get(&first.device, &first.tag)
        .map(|v| serde_json::to_string(&v.value).unwrap_or_default())
        .unwrap_or_else(|| "null".to_string());
    let ctx = TemplateContext {
        rule: rule.config.name.clone(),
        device: first.device.clone(),
        tag: first.tag.clone(),
        value,
        timestamp: Utc::now().to_rfc3339(),
    };

    Plan {
        rule_name: rule.config.name.clone(),
        kind,
        actions,
        ctx,
    }
}

/// Dispatch a plan's actions and record the outcome.
async fn dispatch(inner: &Arc<EngineInner>, plan: Plan, now: Instant) {
    let mut errors: Vec<String> = Vec::new();
    let mut attempted = 0usize;

    for (action_index, action) in &plan.actions {
        attempted += 1;
        let outcome = run_action(inner, &plan.ctx, action).await;

        let mut rules = inner.rules.lock().expect("lock poisoned");
        if let Some(rule) = rules.iter_mut().find(|r| r.config.name == plan.rule_name) {
            let status = if matches!(plan.kind, PlanKind::Clear) {
                rule.cleared_push_status.get_mut(*action_index)
            } else {
                rule.push_status.get_mut(*action_index)
            };
            if let Some(status) = status {
                status.send_count += 1;
                status.last_send = Some(Utc::now());
                match &outcome {
                    Ok(Some(http_status)) => {
                        status.last_http_status = Some(*http_status);
                        if *http_status >= 400 {
                            status.last_error = Some(format!("HTTP {}", http_status));
                        } else {
                            status.last_error = None;
                        }
                    }
                    Ok(None) => status.last_error = None,
                    Err(e) => status.last_error = Some(e.to_string()),
                }
            }
        }
        drop(rules);

        match outcome {
            Ok(Some(http_status)) if http_status >= 400 => {
                errors.push(format!("HTTP {}", http_status));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(rule = plan.rule_name.as_str(), error = %e, "rule action failed");
                errors.push(e.to_string());
            }
        }
    }

    let mut rules = inner.rules.lock().expect("lock poisoned");
    let Some(rule) = rules.iter_mut().find(|r| r.config.name == plan.rule_name) else {
        return;
    };
    match plan.kind {
        PlanKind::Fire { satisfied } => {
            rule.fire_count += 1;
            rule.last_fire = Some(Utc::now());
            rule.last_error = errors.first().cloned();
            rule.satisfied_since = None;

            let cooldown = Duration::from_millis(rule.config.cooldown_ms);
            match rule.config.cooldown_mode {
                CooldownMode::Global => {
                    rule.next_eligible = (rule.config.cooldown_ms > 0).then(|| now + cooldown);
                    rule.state = if attempted > 0 && errors.len() == attempted {
                        RuleState::Error
                    } else if rule.config.cooldown_ms > 0 {
                        RuleState::Cooldown
                    } else {
                        RuleState::WaitingClear
                    };
                }
                CooldownMode::PerCondition => {
                    for i in satisfied {
                        rule.condition_eligible[i] = Some(now + cooldown);
                    }
                    rule.state = if attempted > 0 && errors.len() == attempted {
                        RuleState::Error
                    } else {
                        RuleState::Armed
                    };
                }
            }
            inner.wake.notify_one();
        }
        PlanKind::Clear => {
            if let Some(e) = errors.first() {
                rule.last_error = Some(e.clone());
            }
        }
        PlanKind::Manual => {
            rule.fire_count += 1;
            rule.last_fire = Some(Utc::now());
            rule.last_error = errors.first().cloned();
        }
    }
}

/// Execute one action.
///
/// Returns the HTTP status for webhooks, `None` for the other kinds.
async fn run_action(
    inner: &Arc<EngineInner>,
    ctx: &TemplateContext,
    action: &Action,
) -> Result<Option<u16>> {
    match action {
        Action::PublishOverride { device, tag } => {
            inner.host.force_publish(device, tag).await?;
            Ok(None)
        }
        Action::WriteBack { device, tag, value } => {
            inner.host.write_tag(device, tag, value).await?;
            Ok(None)
        }
        Action::Webhook(webhook) => {
            let body = ctx.render(&webhook.body);
            let status = send_webhook(&inner.http, webhook, body).await?;
            Ok(Some(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::TagValue;
    use crate::rules::condition::CompareOp;
    use std::sync::Mutex as StdMutex;

    /// Host double recording every call.
    struct MockHost {
        writes: StdMutex<Vec<(String, String, Value)>>,
        publishes: StdMutex<Vec<(String, String)>>,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    impl MockHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: StdMutex::new(Vec::new()),
                publishes: StdMutex::new(Vec::new()),
                fail_writes: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl RuleHost for MockHost {
        async fn write_tag(&self, device: &str, tag: &str, value: &Value) -> Result<()> {
            if self.fail_writes.load(std::sync::atomic::Ordering::Acquire) {
                return Err(GatewayError::NotConnected);
            }
            self.writes
                .lock()
                .unwrap()
                .push((device.to_string(), tag.to_string(), value.clone()));
            Ok(())
        }

        async fn force_publish(&self, device: &str, tag: &str) -> Result<()> {
            self.publishes
                .lock()
                .unwrap()
                .push((device.to_string(), tag.to_string()));
            Ok(())
        }
    }

    fn speed_condition(op: CompareOp, value: i64) -> Condition {
        Condition {
            device: "plc1".to_string(),
            tag: "Speed".to_string(),
            op,
            value: Value::Integer(value),
            negate: false,
        }
    }

    fn publish_action() -> Action {
        Action::PublishOverride {
            device: "plc1".to_string(),
            tag: "Speed".to_string(),
        }
    }

    fn rule(name: &str) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            enabled: true,
            conditions: vec![speed_condition(CompareOp::Gt, 100)],
            logic: LogicMode::And,
            debounce_ms: 0,
            cooldown_ms: 0,
            cooldown_mode: CooldownMode::Global,
            actions: vec![publish_action()],
            cleared_actions: vec![],
        }
    }

    struct Harness {
        engine: RuleEngine,
        host: Arc<MockHost>,
        values: Arc<CurrentValueTable>,
        tx: mpsc::Sender<ChangeEvent>,
    }

    fn harness() -> Harness {
        let values = Arc::new(CurrentValueTable::new());
        let host = MockHost::new();
        let engine = RuleEngine::new(Arc::clone(&values), host.clone());
        let (tx, rx) = mpsc::channel(64);
        engine.attach(rx);
        Harness {
            engine,
            host,
            values,
            tx,
        }
    }

    impl Harness {
        async fn set_speed(&self, value: i64) {
            self.values
                .replace("plc1", "Speed", TagValue::ok(Value::Integer(value)));
            let event = ChangeEvent {
                device: "plc1".to_string(),
                tag: "Speed".to_string(),
                selection: Default::default(),
                old: None,
                new: TagValue::ok(Value::Integer(value)),
            };
            self.tx.send(event).await.unwrap();
        }

        fn fire_count(&self, name: &str) -> u64 {
            self.engine.status(name).unwrap().fire_count
        }

        fn state(&self, name: &str) -> RuleState {
            self.engine.status(name).unwrap().state
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_fire_and_clear() {
        let h = harness();
        h.engine.add_rule(rule("overspeed")).unwrap();

        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fire_count("overspeed"), 1);
        assert_eq!(h.state("overspeed"), RuleState::WaitingClear);
        assert_eq!(h.host.publishes.lock().unwrap().len(), 1);

        // Still satisfied: no re-fire without clearing.
        h.set_speed(180).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fire_count("overspeed"), 1);

        // Clears and re-arms.
        h.set_speed(50).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.state("overspeed"), RuleState::Armed);

        // Edge-triggered: satisfied again fires again.
        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fire_count("overspeed"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_rejects_transients() {
        let h = harness();
        let mut config = rule("debounced");
        config.debounce_ms = 500;
        h.engine.add_rule(config).unwrap();

        // True for less than the debounce window.
        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.set_speed(50).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.fire_count("debounced"), 0);

        // Held past the window: fires once.
        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.fire_count("debounced"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_gates_refire() {
        let h = harness();
        let mut config = rule("cooled");
        config.cooldown_ms = 60_000;
        h.engine.add_rule(config).unwrap();

        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fire_count("cooled"), 1);
        assert_eq!(h.state("cooled"), RuleState::Cooldown);

        // Conditions stay satisfied: no re-fire inside the window.
        h.set_speed(160).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.fire_count("cooled"), 1);

        // Window elapses with conditions continuously satisfied: re-fires.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.fire_count("cooled"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_actions_fire_on_rearm() {
        let h = harness();
        let mut config = rule("with_clear");
        config.cleared_actions = vec![Action::WriteBack {
            device: "plc1".to_string(),
            tag: "AlarmAck".to_string(),
            value: Value::Bool(false),
        }];
        h.engine.add_rule(config).unwrap();

        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.host.writes.lock().unwrap().is_empty());

        h.set_speed(50).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let writes = h.host.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, "AlarmAck");
    }

    #[tokio::test(start_paused = true)]
    async fn test_or_logic_and_negate() {
        let h = harness();
        let mut config = rule("either");
        config.logic = LogicMode::Or;
        config.conditions = vec![
            speed_condition(CompareOp::Gt, 100),
            Condition {
                device: "plc1".to_string(),
                tag: "Speed".to_string(),
                op: CompareOp::Ge,
                value: Value::Integer(0),
                negate: true, // "speed is negative"
            },
        ];
        h.engine.add_rule(config).unwrap();

        h.set_speed(-5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fire_count("either"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_condition_cooldown_independent_cadence() {
        let h = harness();
        let mut config = rule("per_cond");
        config.logic = LogicMode::Or;
        config.cooldown_ms = 60_000;
        config.cooldown_mode = CooldownMode::PerCondition;
        config.conditions = vec![
            speed_condition(CompareOp::Gt, 100),
            speed_condition(CompareOp::Lt, -100),
        ];
        h.engine.add_rule(config).unwrap();

        // First condition fires and enters its own cooldown.
        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fire_count("per_cond"), 1);
        assert_eq!(h.state("per_cond"), RuleState::Armed);

        // Second condition is not gated by the first one's cooldown.
        h.set_speed(-150).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fire_count("per_cond"), 2);

        // First condition again, inside its window: no fire.
        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fire_count("per_cond"), 2);

        // After its window: fires again on its own cadence.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.fire_count("per_cond"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_actions_set_error_state() {
        let h = harness();
        let mut config = rule("writeback");
        config.actions = vec![Action::WriteBack {
            device: "plc1".to_string(),
            tag: "Reset".to_string(),
            value: Value::Bool(true),
        }];
        h.engine.add_rule(config).unwrap();
        h.host
            .fail_writes
            .store(true, std::sync::atomic::Ordering::Release);

        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = h.engine.status("writeback").unwrap();
        assert_eq!(status.state, RuleState::Error);
        assert!(status.last_error.is_some());

        // Error state clears like WaitingClear; the loop keeps running.
        h.set_speed(50).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.state("writeback"), RuleState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_now_bypasses_conditions() {
        let h = harness();
        h.engine.add_rule(rule("manual")).unwrap();

        // Condition not satisfied, manual fire still dispatches.
        h.values
            .replace("plc1", "Speed", TagValue::ok(Value::Integer(0)));
        h.engine.fire_now("manual").await.unwrap();

        assert_eq!(h.fire_count("manual"), 1);
        assert_eq!(h.state("manual"), RuleState::Armed);
        assert_eq!(h.host.publishes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_rule_never_fires() {
        let h = harness();
        let mut config = rule("off");
        config.enabled = false;
        h.engine.add_rule(config).unwrap();

        h.set_speed(150).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fire_count("off"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_invalid_rules_rejected() {
        let h = harness();
        h.engine.add_rule(rule("dup")).unwrap();
        assert!(h.engine.add_rule(rule("dup")).is_err());

        let mut bad = rule("bad");
        bad.conditions.clear();
        assert!(h.engine.add_rule(bad).is_err());
    }
}
