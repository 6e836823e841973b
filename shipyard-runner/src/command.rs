//! Command classification
//!
//! Recognizes the build commands that touch the registry or the cluster so
//! their grants can be checked before anything runs and their effects can be
//! recorded once they succeed. Classification works on the command text after
//! plain binding expansion; anything unrecognized is a plain command.

use shipyard_core::domain::binding::is_valid_name;
use shipyard_core::domain::grant::{Capability, ResourceRef};
use shipyard_core::domain::resource::{ImageRef, ResourceHandles};
use shipyard_core::domain::run::Effect;

/// What a (segment of a) command does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Obtains or uses registry credentials
    RegistryLogin,
    ImagePush(ImageRef),
    ImagePull(ImageRef),
    /// Fetches cluster credentials into the kubeconfig
    KubeconfigUpdate,
    ManifestApply(String),
    SetImage {
        deployment: String,
        container: String,
        image: ImageRef,
    },
}

impl CommandKind {
    /// Grant the build identity needs for this command
    ///
    /// Image operations on a repository other than the bound registry are
    /// checked against that foreign repository.
    pub fn required_grant(&self, handles: &ResourceHandles) -> (ResourceRef, Capability) {
        let registry_of = |image: &ImageRef| {
            if handles.registry.owns(image) {
                handles.registry.resource()
            } else {
                ResourceRef::registry(&image.repository)
            }
        };

        match self {
            CommandKind::RegistryLogin => (handles.registry.resource(), Capability::Pull),
            CommandKind::ImagePush(image) => (registry_of(image), Capability::Push),
            CommandKind::ImagePull(image) => (registry_of(image), Capability::Pull),
            CommandKind::KubeconfigUpdate
            | CommandKind::ManifestApply(_)
            | CommandKind::SetImage { .. } => (handles.cluster.resource(), Capability::Deploy),
        }
    }

    /// Effect recorded when the command succeeds
    pub fn effect(&self) -> Option<Effect> {
        match self {
            CommandKind::ImagePush(image) => Some(Effect::ImagePushed {
                image: image.clone(),
            }),
            CommandKind::ManifestApply(manifest) => Some(Effect::ManifestApplied {
                manifest: manifest.clone(),
            }),
            CommandKind::SetImage {
                deployment,
                container,
                image,
            } => Some(Effect::DeploymentUpdated {
                deployment: deployment.clone(),
                container: container.clone(),
                image: image.clone(),
            }),
            CommandKind::RegistryLogin | CommandKind::ImagePull(_) | CommandKind::KubeconfigUpdate => {
                None
            }
        }
    }

    /// A failure of this step means the credential was rejected
    pub fn is_credential_step(&self) -> bool {
        matches!(self, CommandKind::RegistryLogin | CommandKind::KubeconfigUpdate)
    }
}

/// kubectl flags that take a value as the next token
const KUBECTL_VALUE_FLAGS: &[&str] = &["-n", "--namespace", "--context", "--kubeconfig", "-l", "--selector"];

/// docker and podman flags that take a value as the next token
const CONTAINER_VALUE_FLAGS: &[&str] = &[
    "-c",
    "--context",
    "--config",
    "-H",
    "--host",
    "-l",
    "--log-level",
    "--platform",
    "--connection",
    "--url",
];

/// Programs that run the rest of the line as another command
const WRAPPERS: &[&str] = &["sudo", "env", "exec", "command", "nohup", "time"];

/// Wrapper flags that take a value as the next token
const WRAPPER_VALUE_FLAGS: &[&str] = &["-u", "--user", "-g", "--group", "-C", "--chdir", "--unset"];

/// Classifies an expanded command
///
/// Compound commands (`&&`, `||`, `;`, `|`) are split and each segment is
/// classified; the result is empty for plain commands.
pub fn classify(command: &str) -> Vec<CommandKind> {
    let mut kinds = Vec::new();

    for segment in split_segments(command) {
        let tokens: Vec<&str> = segment
            .split_whitespace()
            .map(|t| t.trim_matches(|c| c == '"' || c == '\''))
            .collect();

        for kind in classify_segment(&tokens) {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
    }

    kinds
}

/// Whether the command chains several commands together
pub fn is_compound(command: &str) -> bool {
    split_segments(command).len() > 1
}

fn split_segments(command: &str) -> Vec<&str> {
    command
        .split("&&")
        .flat_map(|s| s.split("||"))
        .flat_map(|s| s.split(';'))
        .flat_map(|s| s.split('|'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn classify_segment(tokens: &[&str]) -> Vec<CommandKind> {
    if tokens.contains(&"get-login-password") {
        return vec![CommandKind::RegistryLogin];
    }
    if tokens.contains(&"update-kubeconfig") {
        return vec![CommandKind::KubeconfigUpdate];
    }

    let tokens = strip_wrappers(tokens);
    let Some((program, rest)) = tokens.split_first() else {
        return Vec::new();
    };

    // `/usr/bin/docker` is `docker`
    let program = program.rsplit('/').next().unwrap_or(*program);

    match program {
        "docker" | "podman" => classify_container_cli(rest),
        "kubectl" => classify_kubectl(rest),
        _ => Vec::new(),
    }
}

/// Skips leading `NAME=value` assignments and wrappers such as `sudo`
fn strip_wrappers<'a, 'b>(mut tokens: &'b [&'a str]) -> &'b [&'a str] {
    loop {
        match tokens.split_first() {
            Some((first, rest)) if is_assignment(first) => tokens = rest,
            Some((first, rest)) if WRAPPERS.contains(first) => {
                tokens = rest;
                while let Some((flag, after)) = tokens.split_first() {
                    if !flag.starts_with('-') {
                        break;
                    }
                    tokens = after;
                    if WRAPPER_VALUE_FLAGS.contains(flag) {
                        tokens = tokens.split_first().map_or(tokens, |(_, after)| after);
                    }
                }
            }
            _ => return tokens,
        }
    }
}

fn is_assignment(token: &str) -> bool {
    token
        .split_once('=')
        .is_some_and(|(name, _)| is_valid_name(name))
}

fn classify_container_cli(args: &[&str]) -> Vec<CommandKind> {
    let mut positional = Vec::new();
    let mut iter = args.iter().copied();

    while let Some(arg) = iter.next() {
        if CONTAINER_VALUE_FLAGS.contains(&arg) {
            iter.next();
        } else if !arg.starts_with('-') {
            positional.push(arg);
        }
    }

    // `docker image push` is `docker push`
    let positional = match positional.as_slice() {
        ["image", rest @ ..] => rest,
        all => all,
    };

    match positional {
        ["login", ..] => vec![CommandKind::RegistryLogin],
        ["push", image, ..] => ImageRef::parse(image)
            .map(CommandKind::ImagePush)
            .into_iter()
            .collect(),
        ["pull", image, ..] => ImageRef::parse(image)
            .map(CommandKind::ImagePull)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn classify_kubectl(args: &[&str]) -> Vec<CommandKind> {
    let mut positional = Vec::new();
    let mut manifests = Vec::new();
    let mut iter = args.iter().copied();

    while let Some(arg) = iter.next() {
        if arg == "-f" || arg == "--filename" {
            if let Some(file) = iter.next() {
                manifests.push(file.to_string());
            }
        } else if let Some(file) = arg.strip_prefix("--filename=") {
            manifests.push(file.to_string());
        } else if KUBECTL_VALUE_FLAGS.contains(&arg) {
            iter.next();
        } else if !arg.starts_with('-') {
            positional.push(arg);
        }
    }

    match positional.as_slice() {
        ["apply", ..] => manifests.into_iter().map(CommandKind::ManifestApply).collect(),
        ["set", "image", target, pairs @ ..] => {
            let Some(deployment) = target
                .strip_prefix("deployment/")
                .or_else(|| target.strip_prefix("deploy/"))
            else {
                return Vec::new();
            };
            pairs
                .iter()
                .filter_map(|pair| {
                    let (container, image) = pair.split_once('=')?;
                    Some(CommandKind::SetImage {
                        deployment: deployment.to_string(),
                        container: container.to_string(),
                        image: ImageRef::parse(image)?,
                    })
                })
                .collect()
        }
        _ => Vec::new(),
    }
}
