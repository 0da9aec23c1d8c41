//! Simulated likes/dislikes: sample reactors from a pool, split them by the
//! source's like ratio and fan the writes out with bounded concurrency.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::executor::for_each_bounded;
use crate::models::{AccountId, Reaction, Subject};
use crate::store::ReactionStore;

/// An account that can be sampled to react or to author comments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reactor {
    pub account_id: AccountId,
    pub token: String,
}

#[derive(Deserialize)]
struct TokenClaims {
    id: serde_json::Value,
}

impl Reactor {
    /// Derive the account id from the `id` claim of a JWT payload.
    pub fn from_token(token: &str) -> Option<Self> {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let claims: TokenClaims = serde_json::from_slice(&bytes).ok()?;
        let account_id = match claims.id {
            serde_json::Value::Number(n) => n.as_i64()?,
            serde_json::Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(Self {
            account_id,
            token: token.to_string(),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReactorPool {
    reactors: Vec<Reactor>,
}

impl ReactorPool {
    /// Keeps the first reactor seen for each account, in order.
    pub fn new(reactors: Vec<Reactor>) -> Self {
        let mut seen = HashSet::new();
        let reactors = reactors
            .into_iter()
            .filter(|r| {
                let first = seen.insert(r.account_id);
                if !first {
                    warn!(account_id = r.account_id, "skipping duplicate reactor account");
                }
                first
            })
            .collect();
        Self { reactors }
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let reactors = tokens
            .into_iter()
            .filter_map(|t| {
                let reactor = Reactor::from_token(t.as_ref());
                if reactor.is_none() {
                    warn!("skipping undecodable reactor token");
                }
                reactor
            })
            .collect();
        Self::new(reactors)
    }

    /// Load a JSON array of tokens.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let tokens: Vec<String> = serde_json::from_str(&content)?;
        let pool = Self::from_tokens(tokens);
        info!(path = %path.display(), reactors = pool.len(), "loaded reactor pool");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    /// `amount` distinct reactors in random order (capped at the pool size).
    pub fn sample<R: Rng + ?Sized>(&self, amount: usize, rng: &mut R) -> Vec<&Reactor> {
        let amount = amount.min(self.reactors.len());
        rand::seq::index::sample(rng, self.reactors.len(), amount)
            .into_iter()
            .map(|i| &self.reactors[i])
            .collect()
    }

    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Reactor> {
        if self.reactors.is_empty() {
            return None;
        }
        Some(&self.reactors[rng.gen_range(0..self.reactors.len())])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngagementCounts {
    pub likes: u64,
    pub dislikes: u64,
}

impl EngagementCounts {
    pub fn new(likes: u64, dislikes: u64) -> Self {
        Self { likes, dislikes }
    }

    /// For sources that do not report dislikes: draw them uniformly from
    /// `[0, floor(likes * ratio)]`.
    pub fn with_estimated_dislikes<R: Rng + ?Sized>(likes: u64, ratio: f64, rng: &mut R) -> Self {
        let ceiling = (likes as f64 * ratio).floor().max(0.0) as u64;
        Self {
            likes,
            dislikes: rng.gen_range(0..=ceiling),
        }
    }

    pub fn total(&self) -> u64 {
        self.likes.saturating_add(self.dislikes)
    }
}

/// Decides how many reactors to draw for a set of counts.
pub trait SampleStrategy: Send + Sync {
    fn sample_size(&self, counts: EngagementCounts, pool_size: usize) -> usize;
}

/// `(likes + dislikes) mod pool_size`. Not proportional to the counts and
/// never reaches the full pool; kept for parity with existing seeded data.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuloSample;

impl SampleStrategy for ModuloSample {
    fn sample_size(&self, counts: EngagementCounts, pool_size: usize) -> usize {
        if pool_size == 0 {
            return 0;
        }
        (counts.total() % pool_size as u64) as usize
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistributionPlan {
    pub likers: Vec<AccountId>,
    pub dislikers: Vec<AccountId>,
}

impl DistributionPlan {
    pub fn len(&self) -> usize {
        self.likers.len() + self.dislikers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sample reactors and split them: the first
/// `floor(sample * likes / (likes + dislikes))` like, the rest dislike.
/// `None` when there is nothing to distribute.
pub fn plan_distribution<R: Rng + ?Sized>(
    counts: EngagementCounts,
    pool: &ReactorPool,
    strategy: &dyn SampleStrategy,
    rng: &mut R,
) -> Option<DistributionPlan> {
    let total = counts.total();
    if total == 0 {
        return None;
    }

    let sample_size = strategy.sample_size(counts, pool.len());
    let sampled = pool.sample(sample_size, rng);
    let split = (sampled.len() as u128 * counts.likes as u128 / total as u128) as usize;

    let (likers, dislikers) = sampled.split_at(split);
    Some(DistributionPlan {
        likers: likers.iter().map(|r| r.account_id).collect(),
        dislikers: dislikers.iter().map(|r| r.account_id).collect(),
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DistributionReport {
    pub likes: usize,
    pub dislikes: usize,
    pub failed: usize,
}

pub struct EngagementEngine {
    store: Arc<dyn ReactionStore>,
    concurrency: usize,
    strategy: Arc<dyn SampleStrategy>,
    rng: Mutex<StdRng>,
}

impl EngagementEngine {
    pub fn new(store: Arc<dyn ReactionStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency,
            strategy: Arc::new(ModuloSample),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn SampleStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Run `f` with the engine's random source.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut rng)
    }

    pub fn plan(&self, counts: EngagementCounts, pool: &ReactorPool) -> Option<DistributionPlan> {
        self.with_rng(|rng| plan_distribution(counts, pool, self.strategy.as_ref(), rng))
    }

    pub async fn distribute(
        &self,
        subject: &Subject,
        counts: EngagementCounts,
        pool: &ReactorPool,
    ) -> DistributionReport {
        let Some(plan) = self.plan(counts, pool) else {
            debug!(%subject, "no engagement to distribute");
            return DistributionReport::default();
        };

        let mut report = DistributionReport::default();
        for (like, group) in [(true, plan.likers), (false, plan.dislikers)] {
            if group.is_empty() {
                continue;
            }
            let size = group.len();
            let fan_out = for_each_bounded(group, self.concurrency, |reactor_id| {
                let store = self.store.clone();
                let reaction = Reaction {
                    subject_kind: subject.kind,
                    subject_id: subject.id.clone(),
                    reactor_id,
                    like,
                };
                async move { store.persist_reaction(&reaction).await }
            })
            .await;

            for e in &fan_out.failures {
                warn!(%subject, like, "reaction write failed: {:#}", e);
            }
            report.failed += fan_out.failures.len();
            if like {
                report.likes = size - fan_out.failures.len();
            } else {
                report.dislikes = size - fan_out.failures.len();
            }
        }

        debug!(
            %subject,
            likes = report.likes,
            dislikes = report.dislikes,
            failed = report.failed,
            "engagement distributed"
        );
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::SubjectKind;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    pub(crate) fn token_for(id: i64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"id":{},"username":"u{}"}}"#, id, id));
        format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", payload)
    }

    pub(crate) fn pool_of(size: i64) -> ReactorPool {
        ReactorPool::from_tokens((1..=size).map(token_for))
    }

    #[test]
    fn test_reactor_from_token() {
        let reactor = Reactor::from_token(&token_for(17)).unwrap();
        assert_eq!(reactor.account_id, 17);

        let string_id = format!(
            "h.{}.s",
            URL_SAFE_NO_PAD.encode(r#"{"id":"23"}"#)
        );
        assert_eq!(Reactor::from_token(&string_id).unwrap().account_id, 23);

        assert!(Reactor::from_token("garbage").is_none());
        assert!(Reactor::from_token("a.!!!.c").is_none());
        assert_eq!(ReactorPool::from_tokens(["bad".to_string(), token_for(1)]).len(), 1);
    }

    #[test]
    fn test_pool_keeps_first_token_per_account() {
        let first = token_for(1);
        let duplicate = format!("{}-again", token_for(1));
        let pool = ReactorPool::from_tokens([first.clone(), duplicate, token_for(2)]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.reactors[0].token, first);
        assert_eq!(pool.reactors[1].account_id, 2);
    }

    #[tokio::test]
    async fn test_duplicate_tokens_never_react_twice() {
        let store = Arc::new(MemoryStore::new());
        let pool = ReactorPool::from_tokens([token_for(1), token_for(1), token_for(2)]);

        for seed in 0..20 {
            let engine = EngagementEngine::new(store.clone(), 4).with_seed(seed);
            let plan = engine.plan(EngagementCounts::new(1, 1), &pool);
            // 2 mod 2 = 0 reactors sampled once duplicates are gone
            assert!(plan.map_or(true, |p| p.is_empty()));

            let subject = Subject::video(format!("v{}", seed));
            let report = engine
                .distribute(&subject, EngagementCounts::new(2, 1), &pool)
                .await;
            let stored = store
                .reactions()
                .await
                .into_iter()
                .filter(|r| r.subject_id == subject.id)
                .count();
            assert_eq!(report.likes + report.dislikes, stored);
        }
    }

    #[test]
    fn test_modulo_sample_size() {
        let s = ModuloSample;
        assert_eq!(s.sample_size(EngagementCounts::new(7, 3), 11), 10);
        assert_eq!(s.sample_size(EngagementCounts::new(7, 4), 11), 0);
        assert_eq!(s.sample_size(EngagementCounts::new(25, 0), 11), 3);
        assert_eq!(s.sample_size(EngagementCounts::new(5, 5), 0), 0);
    }

    #[test]
    fn test_seven_three_split_over_eleven() {
        let pool = pool_of(11);
        let mut rng = StdRng::seed_from_u64(7);
        let plan =
            plan_distribution(EngagementCounts::new(7, 3), &pool, &ModuloSample, &mut rng).unwrap();

        assert_eq!(plan.likers.len(), 7);
        assert_eq!(plan.dislikers.len(), 3);
        assert!(plan.len() <= pool.len());

        let unique: HashSet<_> = plan.likers.iter().chain(&plan.dislikers).collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_zero_counts_have_no_plan() {
        let pool = pool_of(5);
        let mut rng = StdRng::seed_from_u64(1);
        let plan = plan_distribution(EngagementCounts::new(0, 0), &pool, &ModuloSample, &mut rng);
        assert!(plan.is_none());
    }

    #[test]
    fn test_split_is_floored() {
        // 12 mod 9 = 3 sampled, 3 * 8 / 12 = 2 likes
        let pool = pool_of(9);
        let mut rng = StdRng::seed_from_u64(3);
        let plan =
            plan_distribution(EngagementCounts::new(8, 4), &pool, &ModuloSample, &mut rng).unwrap();
        assert_eq!(plan.likers.len(), 2);
        assert_eq!(plan.dislikers.len(), 1);

        // 12 mod 7 = 5 sampled, 5 * 8 / 12 = 3.33 -> 3 likes

        let pool = pool_of(7);
        let plan =
            plan_distribution(EngagementCounts::new(8, 4), &pool, &ModuloSample, &mut rng).unwrap();
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.likers.len(), 3);
        assert_eq!(plan.dislikers.len(), 2);
    }

    #[test]
    fn test_same_seed_same_plan() {
        let pool = pool_of(40);
        let counts = EngagementCounts::new(100, 17);
        let a = plan_distribution(counts, &pool, &ModuloSample, &mut StdRng::seed_from_u64(99));
        let b = plan_distribution(counts, &pool, &ModuloSample, &mut StdRng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn test_estimated_dislikes_within_bounds() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let counts = EngagementCounts::with_estimated_dislikes(57, 0.1, &mut rng);
            assert_eq!(counts.likes, 57);
            assert!(counts.dislikes <= 5);
        }
        let counts = EngagementCounts::with_estimated_dislikes(0, 0.1, &mut rng);
        assert_eq!(counts.total(), 0);
    }

    #[tokio::test]
    async fn test_distribute_writes_one_reaction_per_reactor() {
        let store = Arc::new(MemoryStore::new());
        let engine = EngagementEngine::new(store.clone(), 4).with_seed(11);
        let pool = pool_of(11);

        let report = engine
            .distribute(&Subject::video("vid0000001"), EngagementCounts::new(7, 3), &pool)
            .await;
        assert_eq!(
            report,
            DistributionReport {
                likes: 7,
                dislikes: 3,
                failed: 0
            }
        );

        let reactions = store.reactions().await;
        assert_eq!(reactions.len(), 10);
        assert_eq!(reactions.iter().filter(|r| r.like).count(), 7);
        assert!(reactions
            .iter()
            .all(|r| r.subject_kind == SubjectKind::Video && r.subject_id == "vid0000001"));
    }

    #[tokio::test]
    async fn test_distribute_zero_counts_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let engine = EngagementEngine::new(store.clone(), 50);

        let report = engine
            .distribute(&Subject::comment(3), EngagementCounts::new(0, 0), &pool_of(10))
            .await;
        assert_eq!(report, DistributionReport::default());
        assert!(store.reactions().await.is_empty());
    }

    struct FlakyStore;

    #[async_trait]
    impl ReactionStore for FlakyStore {
        async fn persist_reaction(&self, reaction: &Reaction) -> anyhow::Result<()> {
            if reaction.reactor_id % 2 == 0 {
                anyhow::bail!("duplicate key");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_distribute_counts_failures() {
        let engine = EngagementEngine::new(Arc::new(FlakyStore), 2).with_seed(1);
        // every reactor sampled: 10 mod 11 = 10 of 11
        let report = engine
            .distribute(&Subject::video("v"), EngagementCounts::new(10, 0), &pool_of(11))
            .await;
        assert_eq!(report.likes + report.failed, 10);
        assert_eq!(report.dislikes, 0);
        assert!(report.failed >= 4);
    }
}
