//! Scoped provider credentials
//!
//! DNS providers read their credentials from the process environment, which
//! every in-flight challenge shares. [`EnvironmentScope`] is the single place
//! allowed to write those variables: one process-wide lock, values set on
//! entry, previous state restored when the [`EnvGuard`] drops, even on panic
//! or early return.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), dns01_webhook::solver::SolverError> {
//! use dns01_webhook::solver::{EnvPolicy, EnvironmentScope, config::EnvMap};
//!
//! let scope = EnvironmentScope::new(EnvPolicy::Restore);
//! let envs = EnvMap::from([("EXEC_PATH".to_string(), "/bin/true".to_string())]);
//!
//! {
//!     let _guard = scope.enter(&envs).await?;
//!     // EXEC_PATH is set here and no other scope can be open
//! }
//! // EXEC_PATH is back to its previous value
//! # Ok(())
//! # }
//! ```

use std::env;
use std::ffi::OsString;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::config::{invalid_env, EnvMap};
use super::types::SolverError;

/// Serializes every scope in the process; the environment itself is process-wide
static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// What to do when a requested variable already holds a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvPolicy {
    /// Refuse to overwrite a non-empty value
    #[default]
    Strict,
    /// Overwrite, then put the previous value back on release
    Restore,
}

impl std::str::FromStr for EnvPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(EnvPolicy::Strict),
            "restore" => Ok(EnvPolicy::Restore),
            other => Err(format!("unknown env policy '{}' (expected strict or restore)", other)),
        }
    }
}

impl std::fmt::Display for EnvPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvPolicy::Strict => write!(f, "strict"),
            EnvPolicy::Restore => write!(f, "restore"),
        }
    }
}

/// Entry point for mutating provider environment variables
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentScope {
    policy: EnvPolicy,
}

impl EnvironmentScope {
    pub fn new(policy: EnvPolicy) -> Self {
        Self { policy }
    }

    /// Open a scope with `envs` applied.
    ///
    /// Waits until no other scope is open. An empty map takes no lock. An
    /// entry the OS cannot store is a `Config` error and nothing is set.
    pub async fn enter(&self, envs: &EnvMap) -> Result<EnvGuard, SolverError> {
        if envs.is_empty() {
            return Ok(EnvGuard {
                lock: None,
                saved: Vec::new(),
            });
        }

        if let Some(reason) = envs.iter().find_map(|(k, v)| invalid_env(k, v)) {
            return Err(SolverError::Config(reason));
        }

        let lock = ENV_LOCK.lock().await;

        if self.policy == EnvPolicy::Strict {
            for name in envs.keys() {
                if env::var_os(name).is_some_and(|v| !v.is_empty()) {
                    return Err(SolverError::EnvironmentConflict { name: name.clone() });
                }
            }
        }

        // The guard exists before the first write so an unwind still restores
        let mut guard = EnvGuard {
            lock: Some(lock),
            saved: Vec::with_capacity(envs.len()),
        };
        for (name, value) in envs {
            let previous = env::var_os(name);
            env::set_var(name, value);
            guard.saved.push((name.clone(), previous));
        }

        debug!(
            policy = %self.policy,
            names = ?envs.keys().collect::<Vec<_>>(),
            "Entered environment scope"
        );

        Ok(guard)
    }
}

/// RAII guard for an open scope.
///
/// Dropping it restores every variable to its value before the scope (or
/// removes it if it was absent), then releases the process-wide lock.
pub struct EnvGuard {
    // Released after Drop::drop has restored the variables
    lock: Option<MutexGuard<'static, ()>>,
    saved: Vec<(String, Option<OsString>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, previous) in self.saved.drain(..).rev() {
            match previous {
                Some(value) => env::set_var(&name, value),
                None => env::remove_var(&name),
            }
        }

        if self.lock.is_some() && std::thread::panicking() {
            warn!("Environment scope released during panic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn envs(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_restore_previous_and_absent_values() {
        env::set_var("ENV_SCOPE_T1_PRESENT", "before");
        env::remove_var("ENV_SCOPE_T1_ABSENT");

        let scope = EnvironmentScope::new(EnvPolicy::Restore);
        {
            let _guard = scope
                .enter(&envs(&[("ENV_SCOPE_T1_PRESENT", "inside"), ("ENV_SCOPE_T1_ABSENT", "new")]))
                .await
                .unwrap();
            assert_eq!(env::var("ENV_SCOPE_T1_PRESENT").unwrap(), "inside");
            assert_eq!(env::var("ENV_SCOPE_T1_ABSENT").unwrap(), "new");
        }

        assert_eq!(env::var("ENV_SCOPE_T1_PRESENT").unwrap(), "before");
        assert!(env::var_os("ENV_SCOPE_T1_ABSENT").is_none());
    }

    #[tokio::test]
    async fn test_strict_policy_conflict_mutates_nothing() {
        env::set_var("ENV_SCOPE_T2_TAKEN", "operator-value");
        env::remove_var("ENV_SCOPE_T2_FREE");

        let scope = EnvironmentScope::new(EnvPolicy::Strict);
        let result = scope
            .enter(&envs(&[("ENV_SCOPE_T2_TAKEN", "mine"), ("ENV_SCOPE_T2_FREE", "x")]))
            .await;

        match result {
            Err(SolverError::EnvironmentConflict { name }) => assert_eq!(name, "ENV_SCOPE_T2_TAKEN"),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
        assert_eq!(env::var("ENV_SCOPE_T2_TAKEN").unwrap(), "operator-value");
        assert!(env::var_os("ENV_SCOPE_T2_FREE").is_none());

        // The lock must have been released on the error path
        let guard = tokio::time::timeout(
            Duration::from_secs(5),
            scope.enter(&envs(&[("ENV_SCOPE_T2_FREE", "x")])),
        )
        .await
        .expect("lock leaked")
        .unwrap();
        drop(guard);
        assert!(env::var_os("ENV_SCOPE_T2_FREE").is_none());
    }

    #[tokio::test]
    async fn test_strict_policy_allows_empty_values() {
        env::set_var("ENV_SCOPE_T3_EMPTY", "");

        let scope = EnvironmentScope::new(EnvPolicy::Strict);
        {
            let _guard = scope.enter(&envs(&[("ENV_SCOPE_T3_EMPTY", "v")])).await.unwrap();
            assert_eq!(env::var("ENV_SCOPE_T3_EMPTY").unwrap(), "v");
        }
        assert_eq!(env::var("ENV_SCOPE_T3_EMPTY").unwrap(), "");
    }

    #[tokio::test]
    async fn test_empty_map_takes_no_lock() {
        let scope = EnvironmentScope::new(EnvPolicy::Strict);
        let _held = scope.enter(&envs(&[("ENV_SCOPE_T4_HELD", "1")])).await.unwrap();

        // Would deadlock if the empty scope waited for the held lock
        tokio::time::timeout(Duration::from_secs(5), scope.enter(&EnvMap::new()))
            .await
            .expect("empty scope blocked")
            .unwrap();
    }

    #[tokio::test]
    async fn test_unusable_entry_sets_nothing() {
        let mut bad: Vec<(String, String)> = (0..8)
            .map(|i| (format!("ENV_SCOPE_T7_GOOD_{}", i), "v".to_string()))
            .collect();
        bad.push(("ENV_SCOPE_T7_BAD".to_string(), "a\0b".to_string()));
        let bad: EnvMap = bad.into_iter().collect();

        let scope = EnvironmentScope::new(EnvPolicy::Strict);
        let err = scope.enter(&bad).await.err().expect("unusable entry accepted");
        assert!(matches!(err, SolverError::Config(_)));

        for i in 0..8 {
            assert!(env::var_os(format!("ENV_SCOPE_T7_GOOD_{}", i)).is_none());
        }

        // A later strict scope on the same names is unaffected
        let _guard = tokio::time::timeout(
            Duration::from_secs(5),
            scope.enter(&envs(&[("ENV_SCOPE_T7_GOOD_0", "again")])),
        )
        .await
        .expect("lock leaked")
        .unwrap();
        assert_eq!(env::var("ENV_SCOPE_T7_GOOD_0").unwrap(), "again");

        for name in ["", "ENV_SCOPE=T7"] {
            let err = scope.enter(&envs(&[(name, "x")])).await.err().unwrap();
            assert!(matches!(err, SolverError::Config(_)), "{:?}", name);
        }
    }

    #[tokio::test]
    async fn test_panic_inside_scope_restores() {
        env::set_var("ENV_SCOPE_T8_PRESENT", "before");
        let scope = EnvironmentScope::new(EnvPolicy::Restore);

        let task = tokio::spawn(async move {
            let _guard = scope
                .enter(&envs(&[("ENV_SCOPE_T8_PRESENT", "inside"), ("ENV_SCOPE_T8_ABSENT", "new")]))
                .await
                .unwrap();
            panic!("provider blew up");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(env::var("ENV_SCOPE_T8_PRESENT").unwrap(), "before");
        assert!(env::var_os("ENV_SCOPE_T8_ABSENT").is_none());

        tokio::time::timeout(
            Duration::from_secs(5),
            scope.enter(&envs(&[("ENV_SCOPE_T8_ABSENT", "x")])),
        )
        .await
        .expect("lock not released after panic")
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_disjoint_scopes_restore() {
        let scope = EnvironmentScope::new(EnvPolicy::Restore);
        let mut tasks = Vec::new();

        for i in 0..16 {
            let name = format!("ENV_SCOPE_T5_VAR_{}", i);
            if i % 2 == 0 {
                env::set_var(&name, format!("orig-{}", i));
            } else {
                env::remove_var(&name);
            }

            tasks.push(tokio::spawn(async move {
                for round in 0..10 {
                    let value = format!("task-{}-{}", i, round);
                    let _guard = scope.enter(&envs(&[(name.as_str(), value.as_str())])).await.unwrap();
                    tokio::task::yield_now().await;
                    assert_eq!(env::var(&name).unwrap(), value);
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        for i in 0..16 {
            let name = format!("ENV_SCOPE_T5_VAR_{}", i);
            if i % 2 == 0 {
                assert_eq!(env::var(&name).unwrap(), format!("orig-{}", i));
            } else {
                assert!(env::var_os(&name).is_none());
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scopes_are_serialized() {
        let scope = EnvironmentScope::new(EnvPolicy::Restore);
        let open = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for i in 0..8 {
            let open = open.clone();
            tasks.push(tokio::spawn(async move {
                let value = format!("holder-{}", i);
                let _guard = scope.enter(&envs(&[("ENV_SCOPE_T6_SHARED", value.as_str())])).await.unwrap();

                let before = open.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(before, 0, "two scopes open at once");
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert_eq!(env::var("ENV_SCOPE_T6_SHARED").unwrap(), value);
                open.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert!(env::var_os("ENV_SCOPE_T6_SHARED").is_none());
    }
}
