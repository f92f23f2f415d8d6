//! Process-spawning `ScriptRunner` (spec §1 "user scripts", §6 "Scripts in
//! `<confbase>/`"). `mesh-core` only knows a logical hook name; this module
//! maps that onto the two naming conventions spec §6 lists — the generic
//! `<confbase>/host-up`/`host-down` hook, and the per-peer
//! `<confbase>/hosts/<Name>-up`/`-down` hook — and fork+execs whichever
//! exist, synchronously (spec §5: "a brief stall... scripts are expected to
//! be short").

use std::path::PathBuf;
use std::process::Command;

use mesh_core::script::ScriptRunner;

pub struct ProcessScriptRunner {
    base_path: PathBuf,
}

impl ProcessScriptRunner {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn run_one(&self, path: PathBuf, env: &[(String, String)]) {
        if !path.is_file() {
            return;
        }
        let mut cmd = Command::new(&path);
        cmd.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        match cmd.spawn() {
            Ok(mut child) => {
                let _ = child.wait();
            }
            Err(_) => {}
        }
    }
}

impl ScriptRunner for ProcessScriptRunner {
    fn run(&self, name: &str, env: &[(String, String)]) {
        self.run_one(self.base_path.join(name), env);

        if name == "host-up" || name == "host-down" {
            let node = env.iter().find(|(k, _)| k == "NODE").map(|(_, v)| v.as_str());
            if let Some(node) = node {
                let suffix = if name == "host-up" { "-up" } else { "-down" };
                self.run_one(self.base_path.join("hosts").join(format!("{}{}", node, suffix)), env);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_scripts_are_silently_skipped() {
        let runner = ProcessScriptRunner::new(std::env::temp_dir().join("mesh-service-no-such-dir"));
        runner.run("host-up", &[("NODE".to_string(), "bob".to_string())]);
    }
}
