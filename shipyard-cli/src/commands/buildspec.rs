//! Build spec command handlers
//!
//! Checks a build spec the same way the build stage would before running
//! anything, without contacting the orchestrator.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use colored::*;
use shipyard_core::domain::binding::EnvironmentBinding;
use shipyard_core::domain::buildspec::BuildSpec;
use std::path::PathBuf;

/// Build spec subcommands
#[derive(Subcommand)]
pub enum BuildSpecCommands {
    /// Parse a build spec and check that every referenced variable is bound
    Validate {
        /// Path to the build spec
        #[arg(default_value = "buildspec.yml")]
        file: PathBuf,
    },
}

pub fn handle_buildspec_command(command: BuildSpecCommands) -> Result<()> {
    match command {
        BuildSpecCommands::Validate { file } => {
            let spec = BuildSpec::from_file(&file)
                .with_context(|| format!("Invalid build spec {}", file.display()))?;

            print_phases(&spec);

            let unbound = unbound_references(&spec);
            if !unbound.is_empty() {
                println!();
                for problem in &unbound {
                    println!("  {} {}", "✗".red(), problem);
                }
                bail!("{} command(s) reference unbound variables", unbound.len());
            }

            println!();
            println!("{} {}", "✓".green(), "Build spec is valid".green());
            Ok(())
        }
    }
}

/// Commands that reference a name neither built in nor declared
fn unbound_references(spec: &BuildSpec) -> Vec<String> {
    // Built-in values are only known at build time; names are what matter here
    let mut binding = EnvironmentBinding::builtin("", "", "");
    for (name, value) in spec.declared_variables() {
        binding.insert(name, value);
    }
    for (name, reference) in spec.declared_secrets() {
        binding.insert_secret(name, reference);
    }

    spec.phases()
        .iter()
        .flat_map(|phase| {
            let binding = &binding;
            phase.commands.iter().filter_map(move |command| {
                binding
                    .first_missing(command)
                    .map(|name| format!("{}: `{}` references ${}", phase.name, command, name))
            })
        })
        .collect()
}

fn print_phases(spec: &BuildSpec) {
    println!("{}", "Phases:".bold());
    for phase in spec.phases() {
        println!(
            "  {} {:<10} {} command(s)",
            "▸".cyan(),
            phase.name.to_string(),
            phase.commands.len()
        );
        for (runtime, version) in &phase.runtime_versions {
            println!("      runtime {} {}", runtime, version.dimmed());
        }
    }

    let variables = spec.declared_variables();
    let secrets = spec.declared_secrets();
    if !variables.is_empty() || !secrets.is_empty() {
        println!("\n{}", "Environment:".bold());
        for (name, value) in &variables {
            println!("  {} = {}", name.cyan(), value);
        }
        for (name, reference) in &secrets {
            println!("  {} = {}", name.cyan(), format!("secret {}", reference).dimmed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_and_builtin_names_are_bound() {
        let spec = BuildSpec::from_yaml(
            r#"
version: 0.2
env:
  variables:
    AWS_DEFAULT_REGION: us-east-1
  secrets:
    DB_PASSWORD: "microservice-config:password"
phases:
  build:
    commands:
      - docker build -t $REPOSITORY_URI:$RESOLVED_SOURCE_VERSION .
      - aws eks update-kubeconfig --name $CLUSTER_NAME --region $AWS_DEFAULT_REGION
      - echo ${DB_PASSWORD} > /dev/null
"#,
        )
        .unwrap();

        assert!(unbound_references(&spec).is_empty());
    }

    #[test]
    fn test_unbound_reference_reported() {
        let spec = BuildSpec::from_yaml(
            r#"
version: 0.2
phases:
  post_build:
    commands:
      - kubectl apply -f k8s/$ENVIRONMENT.yaml
"#,
        )
        .unwrap();

        let unbound = unbound_references(&spec);
        assert_eq!(unbound.len(), 1);
        assert!(unbound[0].contains("$ENVIRONMENT"));
    }

    #[test]
    fn test_validate_command_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildspec.yml");
        std::fs::write(
            &path,
            "version: 0.2\nphases:\n  build:\n    commands:\n      - echo $UNSET\n",
        )
        .unwrap();

        let err = handle_buildspec_command(BuildSpecCommands::Validate { file: path }).unwrap_err();
        assert!(err.to_string().contains("unbound"));

        let missing = dir.path().join("missing.yml");
        assert!(handle_buildspec_command(BuildSpecCommands::Validate { file: missing }).is_err());
    }
}
