use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::models::{OverlayRequest, ProvisioningStep};
use crate::overlay::AUTH_KEY_ENV;

const PACKAGES_TIMEOUT: Duration = Duration::from_secs(600);
const DOCKER_TIMEOUT: Duration = Duration::from_secs(900);
const TAILSCALE_TIMEOUT: Duration = Duration::from_secs(300);
const LOCALE_TIMEOUT: Duration = Duration::from_secs(120);

/// The `provisioning` section of a container definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisioningPlan {
    #[serde(default)]
    pub locale_fix: bool,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub docker: bool,
    #[serde(default)]
    pub tailscale: Option<TailscalePlan>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub scripts: Vec<ScriptConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TailscalePlan {
    #[serde(default)]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub accept_routes: bool,
    #[serde(default)]
    pub ssh: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    pub name: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    pub content: String,
    #[serde(default = "default_user")]
    pub run_as: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Seconds.
    #[serde(default = "default_script_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_interpreter() -> String {
    "bash".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

fn default_script_timeout() -> u64 {
    300
}

impl ProvisioningPlan {
    pub fn is_empty(&self) -> bool {
        !self.locale_fix
            && self.packages.is_empty()
            && !self.docker
            && self.tailscale.is_none()
            && self.scripts.is_empty()
    }

    /// Expands the plan into ordered steps: locale fix, packages, Docker,
    /// Tailscale, then custom scripts in file order.
    pub fn steps(&self, hostname: &str) -> Vec<ProvisioningStep> {
        let mut steps = Vec::new();

        if self.locale_fix {
            steps.push(locale_fix_step());
        }
        if !self.packages.is_empty() {
            steps.push(packages_step(&self.packages));
        }
        if self.docker {
            steps.push(docker_step());
        }
        if let Some(ts) = &self.tailscale {
            steps.push(tailscale_step(hostname, ts));
        }
        steps.extend(self.scripts.iter().map(ScriptConfig::to_step));

        steps
    }

    pub fn overlay_request(&self) -> Option<OverlayRequest> {
        self.tailscale.as_ref().map(|ts| OverlayRequest {
            auth_key: ts.auth_key.clone(),
            ephemeral: ts.ephemeral,
            tags: ts.tags.clone(),
        })
    }
}

impl ScriptConfig {
    pub fn to_step(&self) -> ProvisioningStep {
        ProvisioningStep {
            name: self.name.clone(),
            interpreter: self.interpreter.clone(),
            script: self.content.clone(),
            run_as: self.run_as.clone(),
            working_dir: self.working_dir.clone(),
            environment: self.environment.clone(),
            timeout: Duration::from_secs(self.timeout.max(1)),
            continue_on_error: self.continue_on_error,
            overlay_join: false,
        }
    }
}

pub fn locale_fix_step() -> ProvisioningStep {
    let script = "\
if [ -f /etc/locale.gen ]; then
  sed -i 's/^# *en_US.UTF-8 UTF-8/en_US.UTF-8 UTF-8/' /etc/locale.gen
  locale-gen >/dev/null
fi
if command -v update-locale >/dev/null 2>&1; then
  update-locale LANG=en_US.UTF-8 LC_ALL=en_US.UTF-8
fi";
    ProvisioningStep::new("locale-fix", script)
        .with_timeout(LOCALE_TIMEOUT)
        .continue_on_error(true)
}

pub fn packages_step(packages: &[String]) -> ProvisioningStep {
    let list = shell_words::join(packages);
    let script = format!(
        "\
if command -v apt-get >/dev/null 2>&1; then
  export DEBIAN_FRONTEND=noninteractive
  apt-get update -qq && apt-get install -y -qq {list}
elif command -v dnf >/dev/null 2>&1; then
  dnf install -y -q {list}
elif command -v apk >/dev/null 2>&1; then
  apk add --no-cache {list}
else
  echo 'no supported package manager found' >&2
  exit 1
fi"
    );
    ProvisioningStep::new("packages", script).with_timeout(PACKAGES_TIMEOUT)
}

pub fn docker_step() -> ProvisioningStep {
    let script = "\
set -e
if ! command -v curl >/dev/null 2>&1; then
  if command -v apt-get >/dev/null 2>&1; then
    apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq curl ca-certificates
  elif command -v apk >/dev/null 2>&1; then
    apk add --no-cache curl
  fi
fi
curl -fsSL https://get.docker.com | sh
if command -v systemctl >/dev/null 2>&1; then
  systemctl enable --now docker
fi
docker --version";
    ProvisioningStep::new("docker", script).with_timeout(DOCKER_TIMEOUT)
}

/// Installs the Tailscale agent and joins with the key the orchestrator puts
/// in `TS_AUTHKEY`.
pub fn tailscale_step(hostname: &str, plan: &TailscalePlan) -> ProvisioningStep {
    let mut up = vec![
        "tailscale".to_string(),
        "up".to_string(),
        format!("--hostname={hostname}"),
    ];
    if plan.accept_routes {
        up.push("--accept-routes".to_string());
    }
    if plan.ssh {
        up.push("--ssh".to_string());
    }
    if !plan.tags.is_empty() {
        up.push(format!("--advertise-tags={}", plan.tags.join(",")));
    }

    let script = format!(
        "\
set -e
if ! command -v tailscale >/dev/null 2>&1; then
  curl -fsSL https://tailscale.com/install.sh | sh
fi
if command -v systemctl >/dev/null 2>&1; then
  systemctl enable --now tailscaled
fi
{} --authkey=\"${AUTH_KEY_ENV}\"
tailscale ip -4",
        shell_words::join(&up)
    );
    ProvisioningStep::new("tailscale", script)
        .with_timeout(TAILSCALE_TIMEOUT)
        .joins_overlay()
}

/// Interpreter and script that run `step` with its user, working directory
/// and environment. `env` replaces the step's own environment.
pub fn invocation(step: &ProvisioningStep, env: &BTreeMap<String, String>) -> (String, String) {
    let plain = step.run_as == "root" && step.working_dir.is_none() && env.is_empty();
    if plain {
        return (step.interpreter.clone(), step.script.clone());
    }

    let mut argv: Vec<String> = Vec::new();
    if step.run_as != "root" {
        argv.extend(["runuser".to_string(), "-u".to_string(), step.run_as.clone(), "--".to_string()]);
    }
    if !env.is_empty() {
        argv.push("env".to_string());
        argv.extend(env.iter().map(|(k, v)| format!("{k}={v}")));
    }
    argv.extend([step.interpreter.clone(), "-c".to_string(), step.script.clone()]);

    let mut wrapper = String::new();
    if let Some(dir) = &step.working_dir {
        wrapper.push_str(&format!("cd {} && ", shell_words::quote(dir)));
    }
    wrapper.push_str("exec ");
    wrapper.push_str(&shell_words::join(&argv));

    ("sh".to_string(), wrapper)
}
