//! Script runner interface (spec §1 "Out of scope... user scripts
//! (interface: execute named script with environment)"). The real
//! process-spawning implementation (looking a script up under the host's
//! `scripts/` directory, setting up its environment, reaping its exit
//! status) belongs to `mesh-service`; `mesh-core` only needs something it
//! can hand a name and an environment to whenever `graph::compute_graph`
//! reports a reachability change or a verb handler wants `tinc-up`/
//! `subnet-up`-style hooks run.

/// `name` is a logical hook name (`"host-up"`, `"host-down"`, `"tinc-up"`,
/// `"subnet-up"`, `"subnet-down"`), not a filesystem path — resolving that
/// mapping is the implementation's job.
pub trait ScriptRunner: Send + 'static {
    fn run(&self, name: &str, env: &[(String, String)]);
}

/// Records every invocation instead of spawning anything; used by
/// `mesh-core`'s own reactor tests and by callers that haven't configured
/// any hooks.
#[derive(Default)]
pub struct NoopScriptRunner {
    pub calls: parking_lot::Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptRunner for NoopScriptRunner {
    fn run(&self, name: &str, env: &[(String, String)]) {
        self.calls.lock().push((name.to_string(), env.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_runner_records_calls() {
        let runner = NoopScriptRunner::default();
        runner.run("host-up", &[("NODE".to_string(), "b".to_string())]);
        assert_eq!(runner.calls.lock().len(), 1);
        assert_eq!(runner.calls.lock()[0].0, "host-up");
    }
}
