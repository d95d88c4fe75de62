use serde_json::Value;

use crate::config::{BackendConfig, ImageSpec, RuntimeOptions};
use crate::sidecar::EgressTarget;
use crate::template;

/// Label prefix stamped on every container the gateway launches. External
/// tooling finds containers through `docker-mcp-name=<name>`.
pub const LABEL_PREFIX: &str = "docker-mcp";

/// The assembled container-runtime invocation for one image backend: the
/// full argument list and the NAME=VALUE environment the runtime client
/// process needs so `-e NAME` forwarding resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub args: Vec<String>,
    pub env: Vec<String>,
}

/// Assemble the runtime arguments and environment for an image backend.
///
/// Referentially transparent: the same spec, config, options, and sidecar
/// target always produce the same plan.
pub fn plan_launch(
    spec: &ImageSpec,
    config: &BackendConfig,
    options: &RuntimeOptions,
    target: Option<&EgressTarget>,
    read_only: bool,
) -> LaunchPlan {
    let mut args: Vec<String> = vec!["run".to_string()];
    let mut env: Vec<String> = Vec::new();

    if !options.static_containers {
        args.push("--rm".to_string());
    }
    args.push("-i".to_string());
    args.push("--init".to_string());
    push_pair(&mut args, "--security-opt", "no-new-privileges");
    push_pair(&mut args, "--cpus", &options.cpus.to_string());
    push_pair(&mut args, "--memory", &options.memory);
    push_pair(&mut args, "--pull", "never");
    if options.in_dind {
        args.push("--privileged".to_string());
    }

    if spec.disable_network {
        push_pair(&mut args, "--network", "none");
    } else {
        for network in &options.networks {
            push_pair(&mut args, "--network", network);
        }
    }
    if let Some(target) = target {
        push_pair(&mut args, "--network", &target.network);
        push_pair(&mut args, "--link", &target.link);
        push_pair(&mut args, "--dns", &target.dns);
        for (name, value) in &target.env {
            push_pair(&mut args, "-e", &format!("{name}={value}"));
        }
    }

    push_pair(&mut args, "-l", &format!("{LABEL_PREFIX}=true"));
    push_pair(&mut args, "-l", &format!("{LABEL_PREFIX}-tool-type=mcp"));
    push_pair(&mut args, "-l", &format!("{LABEL_PREFIX}-name={}", spec.name));
    push_pair(&mut args, "-l", &format!("{LABEL_PREFIX}-transport=stdio"));

    for secret in &spec.secrets {
        push_pair(&mut args, "-e", &secret.env);
        let value = config.secret(&secret.name).unwrap_or_default();
        env.push(format!("{}={value}", secret.env));
    }

    for entry in &spec.environment {
        push_pair(&mut args, "-e", &entry.name);
        let value = resolve_value(&entry.value, &config.config, &env);
        env.push(format!("{}={value}", entry.name));
    }

    for volume in template::evaluate_list(&spec.volumes, &config.config) {
        let volume = if read_only && !has_mode_suffix(&volume) {
            format!("{volume}:ro")
        } else {
            volume
        };
        push_pair(&mut args, "-v", &volume);
    }

    args.push(spec.image.clone());

    for part in &spec.command {
        let value = if is_template(part) {
            template::evaluate(part, &config.config)
        } else {
            part.clone()
        };
        let value = expand_posix(&value, &env);
        if !value.is_empty() {
            args.push(value);
        }
    }

    LaunchPlan { args, env }
}

/// A template value goes through the evaluator; anything else gets POSIX
/// `$VAR` expansion against the environment accumulated so far.
fn resolve_value(raw: &str, config: &Value, env: &[String]) -> String {
    if is_template(raw) {
        template::evaluate(raw, config)
    } else {
        expand_posix(raw, env)
    }
}

fn is_template(raw: &str) -> bool {
    raw.contains("{{") && raw.contains("}}")
}

fn expand_posix(input: &str, env: &[String]) -> String {
    shellexpand::env_with_context_no_errors(input, |name| env_lookup(env, name)).into_owned()
}

fn env_lookup(env: &[String], name: &str) -> Option<String> {
    env.iter().find_map(|entry| {
        entry
            .split_once('=')
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    })
}

fn has_mode_suffix(volume: &str) -> bool {
    volume.ends_with(":ro") || volume.ends_with(":rw")
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: &str) {
    args.push(flag.to_string());
    args.push(value.to_string());
}
