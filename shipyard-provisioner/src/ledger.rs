//! Registry and cluster ledger
//!
//! Records which run pushed each registry tag and which image each deployment
//! container was switched to, so every mutation is attributable to a single
//! run's revision.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use shipyard_core::domain::resource::{DeploymentRecord, ImageRef, TagRecord};
use shipyard_core::domain::run::Effect;
use shipyard_core::dto::stack::LedgerSnapshot;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    /// Keyed by tag
    tags: BTreeMap<String, TagRecord>,
    /// Keyed by `deployment/container`
    deployments: BTreeMap<String, DeploymentRecord>,
}

impl Ledger {
    /// Records the effects of one run
    ///
    /// Pushes to repositories other than `registry_uri` are not ours to track.
    /// Deployment updates are always recorded, whatever repository the image
    /// comes from, since the cluster they change is ours.
    pub fn record(
        &mut self,
        registry_uri: &str,
        run_id: Uuid,
        revision: &str,
        effects: &[Effect],
        complete: bool,
    ) {
        let now = Utc::now();
        for effect in effects {
            match effect {
                Effect::ImagePushed { image } if image.repository == registry_uri => {
                    self.tags.insert(
                        image.tag.clone(),
                        TagRecord {
                            image: image.clone(),
                            run_id,
                            revision: revision.to_string(),
                            pushed_at: now,
                            complete,
                        },
                    );
                }
                Effect::DeploymentUpdated {
                    deployment,
                    container,
                    image,
                } => {
                    self.deployments.insert(
                        format!("{}/{}", deployment, container),
                        DeploymentRecord {
                            deployment: deployment.clone(),
                            container: container.clone(),
                            image: image.clone(),
                            run_id,
                            updated_at: now,
                        },
                    );
                }
                _ => {}
            }
        }
    }

    pub fn tag(&self, tag: &str) -> Option<&TagRecord> {
        self.tags.get(tag)
    }

    pub fn deployment_image(&self, deployment: &str, container: &str) -> Option<&ImageRef> {
        self.deployments
            .get(&format!("{}/{}", deployment, container))
            .map(|d| &d.image)
    }

    pub fn clear_registry(&mut self) {
        self.tags.clear();
    }

    pub fn clear_cluster(&mut self) {
        self.deployments.clear();
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            tags: self.tags.values().cloned().collect(),
            deployments: self.deployments.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = "acct.dkr.ecr.us-east-1.amazonaws.com/app";

    #[test]
    fn test_record_attributes_tags_to_run() {
        let mut ledger = Ledger::default();
        let run_id = Uuid::new_v4();
        let effects = vec![
            Effect::ImagePushed {
                image: ImageRef::new(REGISTRY, "latest"),
            },
            Effect::ImagePushed {
                image: ImageRef::new(REGISTRY, "abc123"),
            },
            Effect::DeploymentUpdated {
                deployment: "data-microservice".to_string(),
                container: "microservice".to_string(),
                image: ImageRef::new(REGISTRY, "abc123"),
            },
        ];

        ledger.record(REGISTRY, run_id, "abc123", &effects, true);

        let tag = ledger.tag("abc123").unwrap();
        assert_eq!(tag.run_id, run_id);
        assert!(tag.complete);
        assert_eq!(
            ledger.deployment_image("data-microservice", "microservice").unwrap().tag,
            "abc123"
        );
        assert_eq!(ledger.snapshot().tags.len(), 2);
    }

    #[test]
    fn test_incomplete_run_keeps_prior_deployment() {
        let mut ledger = Ledger::default();
        ledger.record(
            REGISTRY,
            Uuid::new_v4(),
            "old111",
            &[Effect::DeploymentUpdated {
                deployment: "data-microservice".to_string(),
                container: "microservice".to_string(),
                image: ImageRef::new(REGISTRY, "old111"),
            }],
            true,
        );

        ledger.record(
            REGISTRY,
            Uuid::new_v4(),
            "new222",
            &[Effect::ImagePushed {
                image: ImageRef::new(REGISTRY, "new222"),
            }],
            false,
        );

        assert!(!ledger.tag("new222").unwrap().complete);
        assert_eq!(
            ledger.deployment_image("data-microservice", "microservice").unwrap().tag,
            "old111"
        );
    }

    #[test]
    fn test_foreign_pushes_ignored() {
        let mut ledger = Ledger::default();
        ledger.record(
            REGISTRY,
            Uuid::new_v4(),
            "abc123",
            &[Effect::ImagePushed {
                image: ImageRef::new("docker.io/someone/else", "abc123"),
            }],
            true,
        );
        assert!(ledger.tag("abc123").is_none());
    }

    #[test]
    fn test_foreign_image_deployment_recorded() {
        let mut ledger = Ledger::default();
        let run_id = Uuid::new_v4();
        ledger.record(
            REGISTRY,
            run_id,
            "abc123",
            &[
                Effect::ImagePushed {
                    image: ImageRef::new("docker.io/someone/else", "abc123"),
                },
                Effect::DeploymentUpdated {
                    deployment: "data-microservice".to_string(),
                    container: "microservice".to_string(),
                    image: ImageRef::new("docker.io/someone/else", "abc123"),
                },
            ],
            false,
        );

        assert!(ledger.tag("abc123").is_none());
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.deployments.len(), 1);
        assert_eq!(snapshot.deployments[0].run_id, run_id);
        assert_eq!(snapshot.deployments[0].image.repository, "docker.io/someone/else");
    }
}
