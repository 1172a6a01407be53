use std::collections::HashMap;

use anyhow::{bail, Result};

use super::event::StatisticType;
use super::rollup::{RollupPolicy, MAX_ROLLUP_TAGS};

/// A named statistic's declared shape: its type, tag schema, and rollup
/// policy. Consulted before rollup and validation of incoming events.
#[derive(Debug, Clone)]
pub struct StatisticDefinition {
    pub name: String,
    pub statistic_type: StatisticType,
    /// Ordered tag names; events must supply values in this order.
    pub tag_names: Vec<String>,
    pub rollup: RollupPolicy,
}

/// Read-only lookup from statistic name to its definition. The definition
/// store itself (documents, persistence) lives outside this engine.
pub trait StatisticDefinitionSource: Send + Sync {
    fn definition(&self, name: &str) -> Option<&StatisticDefinition>;
}

/// Definition source backed by a map built at startup from configuration.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionSource {
    definitions: HashMap<String, StatisticDefinition>,
}

impl InMemoryDefinitionSource {
    /// Builds the source, rejecting definitions whose rollup policy does not
    /// fit the declared tag schema.
    pub fn new(definitions: Vec<StatisticDefinition>) -> Result<Self> {
        let mut map = HashMap::with_capacity(definitions.len());

        for def in definitions {
            validate_definition(&def)?;
            if map.insert(def.name.clone(), def).is_some() {
                bail!("duplicate statistic definition");
            }
        }

        Ok(Self { definitions: map })
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl StatisticDefinitionSource for InMemoryDefinitionSource {
    fn definition(&self, name: &str) -> Option<&StatisticDefinition> {
        self.definitions.get(name)
    }
}

fn validate_definition(def: &StatisticDefinition) -> Result<()> {
    if def.name.is_empty() {
        bail!("statistic definition has an empty name");
    }

    match &def.rollup {
        RollupPolicy::None => {}
        RollupPolicy::All => {
            if def.tag_names.len() > MAX_ROLLUP_TAGS {
                bail!(
                    "statistic '{}': rollup 'all' over {} tags exceeds the maximum of {}",
                    def.name,
                    def.tag_names.len(),
                    MAX_ROLLUP_TAGS
                );
            }
        }
        RollupPolicy::Masks(masks) => {
            for mask in masks {
                for &pos in mask {
                    if pos >= def.tag_names.len() {
                        bail!(
                            "statistic '{}': rollup mask position {} outside tag schema of {} tags",
                            def.name,
                            pos,
                            def.tag_names.len()
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
