use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures_util::{StreamExt, stream::FuturesUnordered};
use skein_wire::{Multiaddr, PeerId};
use smol_timeout2::TimeoutExt;
use thiserror::Error;

use crate::{
    config::TraversalConfig,
    dial_ranker::{PathKind, classify},
    errors::NodeError,
    events::{EventBus, NodeEvent},
    upgrade::UpgradedConn,
};

#[derive(Debug, Error)]
pub enum TraversalError {
    #[error("no traversal candidates")]
    NoCandidate,
    #[error("missing context: {0}")]
    MissingContext(String),
    #[error("connection limit reached")]
    ConnectionLimitReached,
    #[error("every traversal attempt failed: {0:?}")]
    AllAttemptsFailed(Vec<(String, String)>),
    #[error("traversal timed out")]
    Timeout,
    #[error("attempt failed: {0}")]
    Attempt(String),
}

impl From<NodeError> for TraversalError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::ConnectionLimitReached | NodeError::ResourceLimitExceeded { .. } => {
                TraversalError::ConnectionLimitReached
            }
            other => TraversalError::Attempt(other.to_string()),
        }
    }
}

/// Everything a mechanism may consult about the traversal in progress.
pub struct TraversalContext {
    pub target: PeerId,
    pub known_addrs: Vec<Multiaddr>,
    /// An existing limited (relayed) connection to the target, when one
    /// exists. Hole punching cannot run without it.
    pub limited_conn: Option<Arc<UpgradedConn>>,
}

#[derive(Clone, Debug)]
pub struct TraversalCandidate {
    pub mechanism_id: String,
    pub peer: PeerId,
    pub address: Option<Multiaddr>,
    pub path_kind: PathKind,
    pub score: u32,
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct TraversalResult {
    pub connected_peer: PeerId,
    pub selected_address: Option<Multiaddr>,
    pub mechanism_id: String,
}

/// One way of reaching a peer. Mechanisms produce candidates from context
/// and know how to execute a single candidate.
#[async_trait]
pub trait TraversalMechanism: Send + Sync + 'static {
    fn id(&self) -> &str;

    async fn collect_candidates(
        &self,
        ctx: &TraversalContext,
    ) -> Result<Vec<TraversalCandidate>, TraversalError>;

    async fn attempt(
        &self,
        candidate: &TraversalCandidate,
        ctx: &TraversalContext,
    ) -> Result<TraversalResult, TraversalError>;
}

/// Extra candidate sources (discovery backends, peer exchange) that feed the
/// coordinator without being mechanisms themselves.
#[async_trait]
pub trait HintProvider: Send + Sync + 'static {
    async fn hints(&self, ctx: &TraversalContext) -> Vec<TraversalCandidate>;
}

/// The capability a mechanism uses to actually dial. The swarm implements
/// this; mechanisms never talk to transports directly.
#[async_trait]
pub trait CandidateDialer: Send + Sync + 'static {
    async fn dial_addr(&self, peer: Option<PeerId>, addr: &Multiaddr) -> Result<PeerId, NodeError>;
}

/// The coordinated CONNECT/SYNC rendezvous that precedes a simultaneous
/// open. A collaborator service implements it; the hole-punch mechanism only
/// supplies context and consumes the address it yields.
#[async_trait]
pub trait RendezvousService: Send + Sync + 'static {
    async fn coordinate(
        &self,
        peer: PeerId,
        limited: Arc<UpgradedConn>,
    ) -> Result<Multiaddr, TraversalError>;
}

/// Decides whether a failed mechanism group should fall through to the next
/// one.
pub fn should_fallback(err: &TraversalError) -> bool {
    !matches!(err, TraversalError::ConnectionLimitReached)
}

/// Runs the ordered mechanism pipeline: collect candidates per mechanism
/// (folding in hints), race each group's candidates concurrently, take the
/// first success, fall through on exhaustion.
pub struct TraversalCoordinator {
    mechanisms: Vec<Arc<dyn TraversalMechanism>>,
    hint_providers: Vec<Arc<dyn HintProvider>>,
    cfg: TraversalConfig,
    events: Arc<EventBus>,
}

impl TraversalCoordinator {
    pub fn new(
        mechanisms: Vec<Arc<dyn TraversalMechanism>>,
        hint_providers: Vec<Arc<dyn HintProvider>>,
        cfg: TraversalConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            mechanisms,
            hint_providers,
            cfg,
            events,
        }
    }

    pub fn add_hint_provider(&mut self, provider: Arc<dyn HintProvider>) {
        self.hint_providers.push(provider);
    }

    #[tracing::instrument(skip_all, fields(target = display(ctx.target)))]
    pub async fn traverse(&self, ctx: TraversalContext) -> Result<TraversalResult, TraversalError> {
        let ctx = Arc::new(ctx);
        let mut hints: Vec<TraversalCandidate> = vec![];
        for provider in &self.hint_providers {
            hints.extend(provider.hints(&ctx).await);
        }
        self.run_pipeline(ctx, hints)
            .timeout(self.cfg.overall_timeout())
            .await
            .unwrap_or(Err(TraversalError::Timeout))
    }

    async fn run_pipeline(
        &self,
        ctx: Arc<TraversalContext>,
        hints: Vec<TraversalCandidate>,
    ) -> Result<TraversalResult, TraversalError> {
        let mut failures: Vec<(String, String)> = vec![];
        let mut saw_candidates = false;
        for mechanism in &self.mechanisms {
            let mut candidates = match mechanism.collect_candidates(&ctx).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    if should_fallback(&err) {
                        failures.push((mechanism.id().to_string(), err.to_string()));
                        continue;
                    }
                    return Err(err);
                }
            };
            candidates.extend(
                hints
                    .iter()
                    .filter(|hint| hint.mechanism_id == mechanism.id())
                    .cloned(),
            );
            if candidates.is_empty() {
                continue;
            }
            saw_candidates = true;
            candidates.sort_by(|a, b| b.score.cmp(&a.score));

            match self.race_group(mechanism.clone(), ctx.clone(), candidates).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !should_fallback(&err) {
                        return Err(err);
                    }
                    failures.push((mechanism.id().to_string(), err.to_string()));
                }
            }
        }
        if !saw_candidates && failures.is_empty() {
            return Err(TraversalError::NoCandidate);
        }
        Err(TraversalError::AllAttemptsFailed(failures))
    }

    /// Starts every candidate of one mechanism concurrently; the first
    /// success cancels the rest.
    async fn race_group(
        &self,
        mechanism: Arc<dyn TraversalMechanism>,
        ctx: Arc<TraversalContext>,
        candidates: Vec<TraversalCandidate>,
    ) -> Result<TraversalResult, TraversalError> {
        let attempt_timeout = self.cfg.attempt_timeout();
        let mut in_flight = FuturesUnordered::new();
        for candidate in candidates {
            let mechanism = mechanism.clone();
            let ctx = ctx.clone();
            in_flight.push(smolscale::spawn(async move {
                mechanism
                    .attempt(&candidate, &ctx)
                    .timeout(attempt_timeout)
                    .await
                    .unwrap_or(Err(TraversalError::Timeout))
            }));
        }

        let mut limit_hit = false;
        let mut last_failure = None;
        while let Some(outcome) = in_flight.next().await {
            let succeeded = outcome.is_ok();
            self.events
                .emit(NodeEvent::TraversalAttempt {
                    peer: ctx.target,
                    mechanism: mechanism.id().to_string(),
                    succeeded,
                })
                .await;
            match outcome {
                Ok(result) => return Ok(result),
                Err(TraversalError::ConnectionLimitReached) => limit_hit = true,
                Err(err) => last_failure = Some(err),
            }
        }
        if limit_hit {
            return Err(TraversalError::ConnectionLimitReached);
        }
        Err(last_failure.unwrap_or(TraversalError::NoCandidate))
    }
}

fn direct_candidate(mechanism_id: &str, peer: PeerId, addr: Multiaddr) -> TraversalCandidate {
    let path_kind = classify(&addr);
    TraversalCandidate {
        mechanism_id: mechanism_id.to_string(),
        peer,
        path_kind,
        score: match path_kind {
            PathKind::Local => 100,
            PathKind::IpQuic => 80,
            PathKind::IpTcp => 70,
            PathKind::Wrapped => 50,
            PathKind::Relay => 10,
        },
        address: Some(addr),
        metadata: HashMap::new(),
    }
}

/// Dials addresses that live on the local segment.
pub struct LocalDirectMechanism {
    pub dialer: Arc<dyn CandidateDialer>,
}

#[async_trait]
impl TraversalMechanism for LocalDirectMechanism {
    fn id(&self) -> &str {
        "local-direct"
    }

    async fn collect_candidates(
        &self,
        ctx: &TraversalContext,
    ) -> Result<Vec<TraversalCandidate>, TraversalError> {
        Ok(ctx
            .known_addrs
            .iter()
            .filter(|addr| classify(addr) == PathKind::Local)
            .map(|addr| direct_candidate(self.id(), ctx.target, addr.clone()))
            .collect())
    }

    async fn attempt(
        &self,
        candidate: &TraversalCandidate,
        ctx: &TraversalContext,
    ) -> Result<TraversalResult, TraversalError> {
        attempt_dial(&*self.dialer, self.id(), candidate, ctx).await
    }
}

/// Dials publicly reachable addresses.
pub struct DirectMechanism {
    pub dialer: Arc<dyn CandidateDialer>,
}

#[async_trait]
impl TraversalMechanism for DirectMechanism {
    fn id(&self) -> &str {
        "direct"
    }

    async fn collect_candidates(
        &self,
        ctx: &TraversalContext,
    ) -> Result<Vec<TraversalCandidate>, TraversalError> {
        Ok(ctx
            .known_addrs
            .iter()
            .filter(|addr| !matches!(classify(addr), PathKind::Local | PathKind::Relay))
            .map(|addr| direct_candidate(self.id(), ctx.target, addr.clone()))
            .collect())
    }

    async fn attempt(
        &self,
        candidate: &TraversalCandidate,
        ctx: &TraversalContext,
    ) -> Result<TraversalResult, TraversalError> {
        attempt_dial(&*self.dialer, self.id(), candidate, ctx).await
    }
}

/// Coordinates a simultaneous open through an existing relayed connection.
/// Without that limited connection there is nothing to coordinate over, so
/// it contributes no candidates.
pub struct HolePunchMechanism {
    pub dialer: Arc<dyn CandidateDialer>,
    pub rendezvous: Arc<dyn RendezvousService>,
}

#[async_trait]
impl TraversalMechanism for HolePunchMechanism {
    fn id(&self) -> &str {
        "hole-punch"
    }

    async fn collect_candidates(
        &self,
        ctx: &TraversalContext,
    ) -> Result<Vec<TraversalCandidate>, TraversalError> {
        if ctx.limited_conn.is_none() {
            return Ok(vec![]);
        }
        Ok(vec![TraversalCandidate {
            mechanism_id: self.id().to_string(),
            peer: ctx.target,
            address: None,
            path_kind: PathKind::IpTcp,
            score: 40,
            metadata: HashMap::new(),
        }])
    }

    async fn attempt(
        &self,
        _candidate: &TraversalCandidate,
        ctx: &TraversalContext,
    ) -> Result<TraversalResult, TraversalError> {
        let limited = ctx
            .limited_conn
            .clone()
            .ok_or_else(|| TraversalError::MissingContext("no limited connection".into()))?;
        let punched = self.rendezvous.coordinate(ctx.target, limited).await?;
        let peer = self
            .dialer
            .dial_addr(Some(ctx.target), &punched)
            .await
            .map_err(TraversalError::from)?;
        Ok(TraversalResult {
            connected_peer: peer,
            selected_address: Some(punched),
            mechanism_id: self.id().to_string(),
        })
    }
}

/// Routes through configured relay endpoints, as the mechanism of last
/// resort.
pub struct RelayMechanism {
    pub dialer: Arc<dyn CandidateDialer>,
    pub relays: Vec<Multiaddr>,
}

#[async_trait]
impl TraversalMechanism for RelayMechanism {
    fn id(&self) -> &str {
        "relay"
    }

    async fn collect_candidates(
        &self,
        ctx: &TraversalContext,
    ) -> Result<Vec<TraversalCandidate>, TraversalError> {
        let circuit: Multiaddr = vec![skein_wire::Component::P2pCircuit].into();
        Ok(self
            .relays
            .iter()
            .map(|relay| {
                let mut candidate = direct_candidate(
                    self.id(),
                    ctx.target,
                    relay.encapsulate(&circuit),
                );
                candidate.path_kind = PathKind::Relay;
                candidate.score = 10;
                candidate
            })
            .collect())
    }

    async fn attempt(
        &self,
        candidate: &TraversalCandidate,
        ctx: &TraversalContext,
    ) -> Result<TraversalResult, TraversalError> {
        attempt_dial(&*self.dialer, self.id(), candidate, ctx).await
    }
}

async fn attempt_dial(
    dialer: &dyn CandidateDialer,
    mechanism_id: &str,
    candidate: &TraversalCandidate,
    ctx: &TraversalContext,
) -> Result<TraversalResult, TraversalError> {
    let addr = candidate
        .address
        .as_ref()
        .ok_or_else(|| TraversalError::MissingContext("candidate has no address".into()))?;
    let peer = dialer
        .dial_addr(Some(ctx.target), addr)
        .await
        .map_err(TraversalError::from)?;
    Ok(TraversalResult {
        connected_peer: peer,
        selected_address: Some(addr.clone()),
        mechanism_id: mechanism_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OverflowPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer(n: u8) -> PeerId {
        skein_wire::KeyPair::from_seed([n; 32]).peer_id()
    }

    fn coordinator(mechanisms: Vec<Arc<dyn TraversalMechanism>>) -> TraversalCoordinator {
        TraversalCoordinator::new(
            mechanisms,
            vec![],
            TraversalConfig {
                attempt_timeout_ms: 500,
                overall_timeout_ms: 2_000,
            },
            Arc::new(EventBus::new(64, OverflowPolicy::DropOldest)),
        )
    }

    struct ScriptedMechanism {
        id: &'static str,
        candidates: usize,
        succeed_on: Option<usize>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl TraversalMechanism for ScriptedMechanism {
        fn id(&self) -> &str {
            self.id
        }

        async fn collect_candidates(
            &self,
            ctx: &TraversalContext,
        ) -> Result<Vec<TraversalCandidate>, TraversalError> {
            Ok((0..self.candidates)
                .map(|i| TraversalCandidate {
                    mechanism_id: self.id.to_string(),
                    peer: ctx.target,
                    address: None,
                    path_kind: PathKind::IpTcp,
                    score: i as u32,
                    metadata: HashMap::new(),
                })
                .collect())
        }

        async fn attempt(
            &self,
            candidate: &TraversalCandidate,
            ctx: &TraversalContext,
        ) -> Result<TraversalResult, TraversalError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if Some(candidate.score as usize) == self.succeed_on {
                Ok(TraversalResult {
                    connected_peer: ctx.target,
                    selected_address: None,
                    mechanism_id: self.id.to_string(),
                })
            } else {
                let _ = n;
                Err(TraversalError::Attempt("scripted failure".into()))
            }
        }
    }

    fn ctx(target: PeerId) -> TraversalContext {
        TraversalContext {
            target,
            known_addrs: vec![],
            limited_conn: None,
        }
    }

    #[test]
    fn falls_through_to_later_mechanism() {
        smolscale::block_on(async {
            let first = Arc::new(ScriptedMechanism {
                id: "local-direct",
                candidates: 2,
                succeed_on: None,
                attempts: AtomicUsize::new(0),
            });
            let second = Arc::new(ScriptedMechanism {
                id: "direct",
                candidates: 2,
                succeed_on: Some(1),
                attempts: AtomicUsize::new(0),
            });
            let coordinator =
                coordinator(vec![first.clone() as Arc<dyn TraversalMechanism>, second.clone()]);
            let result = coordinator.traverse(ctx(peer(1))).await.unwrap();
            assert_eq!(result.mechanism_id, "direct");
            assert_eq!(first.attempts.load(Ordering::SeqCst), 2);
        })
    }

    #[test]
    fn no_candidates_anywhere() {
        smolscale::block_on(async {
            let empty = Arc::new(ScriptedMechanism {
                id: "direct",
                candidates: 0,
                succeed_on: None,
                attempts: AtomicUsize::new(0),
            });
            let coordinator = coordinator(vec![empty as Arc<dyn TraversalMechanism>]);
            assert!(matches!(
                coordinator.traverse(ctx(peer(2))).await,
                Err(TraversalError::NoCandidate)
            ));
        })
    }

    #[test]
    fn exhaustion_reports_per_mechanism_failures() {
        smolscale::block_on(async {
            let a = Arc::new(ScriptedMechanism {
                id: "local-direct",
                candidates: 1,
                succeed_on: None,
                attempts: AtomicUsize::new(0),
            });
            let b = Arc::new(ScriptedMechanism {
                id: "direct",
                candidates: 1,
                succeed_on: None,
                attempts: AtomicUsize::new(0),
            });
            let coordinator = coordinator(vec![a as Arc<dyn TraversalMechanism>, b]);
            match coordinator.traverse(ctx(peer(3))).await {
                Err(TraversalError::AllAttemptsFailed(failures)) => {
                    assert_eq!(failures.len(), 2);
                }
                other => panic!("expected AllAttemptsFailed, got {other:?}"),
            }
        })
    }

    struct LimitMechanism;

    #[async_trait]
    impl TraversalMechanism for LimitMechanism {
        fn id(&self) -> &str {
            "direct"
        }

        async fn collect_candidates(
            &self,
            ctx: &TraversalContext,
        ) -> Result<Vec<TraversalCandidate>, TraversalError> {
            Ok(vec![TraversalCandidate {
                mechanism_id: "direct".into(),
                peer: ctx.target,
                address: None,
                path_kind: PathKind::IpTcp,
                score: 0,
                metadata: HashMap::new(),
            }])
        }

        async fn attempt(
            &self,
            _candidate: &TraversalCandidate,
            _ctx: &TraversalContext,
        ) -> Result<TraversalResult, TraversalError> {
            Err(TraversalError::ConnectionLimitReached)
        }
    }

    #[test]
    fn limit_reached_stops_the_pipeline() {
        smolscale::block_on(async {
            let never_reached = Arc::new(ScriptedMechanism {
                id: "relay",
                candidates: 1,
                succeed_on: Some(0),
                attempts: AtomicUsize::new(0),
            });
            let coordinator =
                coordinator(vec![
                    Arc::new(LimitMechanism) as Arc<dyn TraversalMechanism>,
                    never_reached.clone(),
                ]);
            assert!(matches!(
                coordinator.traverse(ctx(peer(4))).await,
                Err(TraversalError::ConnectionLimitReached)
            ));
            assert_eq!(never_reached.attempts.load(Ordering::SeqCst), 0);
        })
    }

    #[test]
    fn hole_punch_needs_a_limited_connection() {
        smolscale::block_on(async {
            struct NeverDialer;
            #[async_trait]
            impl CandidateDialer for NeverDialer {
                async fn dial_addr(
                    &self,
                    _peer: Option<PeerId>,
                    _addr: &Multiaddr,
                ) -> Result<PeerId, NodeError> {
                    unreachable!("no candidates should mean no dials")
                }
            }
            struct NeverRendezvous;
            #[async_trait]
            impl RendezvousService for NeverRendezvous {
                async fn coordinate(
                    &self,
                    _peer: PeerId,
                    _limited: Arc<UpgradedConn>,
                ) -> Result<Multiaddr, TraversalError> {
                    unreachable!()
                }
            }
            let mechanism = HolePunchMechanism {
                dialer: Arc::new(NeverDialer),
                rendezvous: Arc::new(NeverRendezvous),
            };
            let candidates = mechanism.collect_candidates(&ctx(peer(5))).await.unwrap();
            assert!(candidates.is_empty());
        })
    }

    #[test]
    fn hints_feed_matching_mechanisms() {
        smolscale::block_on(async {
            struct OneHint;
            #[async_trait]
            impl HintProvider for OneHint {
                async fn hints(&self, ctx: &TraversalContext) -> Vec<TraversalCandidate> {
                    vec![TraversalCandidate {
                        mechanism_id: "direct".into(),
                        peer: ctx.target,
                        address: None,
                        path_kind: PathKind::IpTcp,
                        score: 7,
                        metadata: HashMap::new(),
                    }]
                }
            }
            // the mechanism itself produces nothing; the hint alone wins
            let mechanism = Arc::new(ScriptedMechanism {
                id: "direct",
                candidates: 0,
                succeed_on: Some(7),
                attempts: AtomicUsize::new(0),
            });
            let mut coordinator = coordinator(vec![mechanism as Arc<dyn TraversalMechanism>]);
            coordinator.add_hint_provider(Arc::new(OneHint));
            let result = coordinator.traverse(ctx(peer(6))).await.unwrap();
            assert_eq!(result.mechanism_id, "direct");
        })
    }
}
