//! Choose a step method for every variable of a target.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SamplerError},
    model::{Support, VariableInfo},
    step_method::StepMethodKind,
};

/// How well a step method can sample a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Competence {
    Incompatible,
    Compatible,
    Better,
    Ideal,
}

/// The properties of a variable that matter for step method selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableDescriptor {
    pub support: Support,
    pub has_gradient: bool,
}

impl StepMethodKind {
    pub fn competence(&self, variable: &VariableDescriptor) -> Competence {
        let VariableDescriptor {
            support,
            has_gradient,
        } = *variable;
        match self {
            StepMethodKind::Nuts if support.is_continuous() && has_gradient => Competence::Ideal,
            StepMethodKind::Hmc if support.is_continuous() && has_gradient => Competence::Better,
            StepMethodKind::Nuts | StepMethodKind::Hmc => Competence::Incompatible,
            StepMethodKind::Metropolis => match support {
                Support::Discrete => Competence::Ideal,
                _ => Competence::Compatible,
            },
            StepMethodKind::BinaryMetropolis => match support {
                Support::Binary => Competence::Ideal,
                _ => Competence::Incompatible,
            },
        }
    }
}

/// Caller supplied assignment of variables to a step method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAssignment {
    pub method: StepMethodKind,
    pub variables: Vec<String>,
}

impl StepAssignment {
    pub fn new<S: Into<String>>(
        method: StepMethodKind,
        variables: impl IntoIterator<Item = S>,
    ) -> Self {
        StepAssignment {
            method,
            variables: variables.into_iter().map(Into::into).collect(),
        }
    }
}

/// A block of variables that is updated by one step method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAssignment {
    pub method: StepMethodKind,
    pub variables: Vec<String>,
    /// Positions of the block coordinates in the parameter vector.
    pub indices: Vec<usize>,
}

/// Check that the variables tile `0..dim` without gaps or overlaps.
pub(crate) fn validate_layout(dim: usize, variables: &[VariableInfo]) -> Result<()> {
    let covered: usize = variables.iter().map(|var| var.size).sum();
    if covered != dim {
        return Err(SamplerError::DimensionMismatch { dim, covered });
    }

    let mut names = HashSet::new();
    for var in variables.iter() {
        if var.size == 0 {
            return Err(SamplerError::InvalidLayout(format!(
                "variable `{}` has size zero",
                var.name
            )));
        }
        if !names.insert(var.name.as_str()) {
            return Err(SamplerError::InvalidLayout(format!(
                "variable `{}` appears more than once",
                var.name
            )));
        }
    }

    let mut sorted: Vec<&VariableInfo> = variables.iter().collect();
    sorted.sort_by_key(|var| var.offset);
    let mut next = 0;
    for var in sorted {
        if var.offset != next {
            return Err(SamplerError::InvalidLayout(format!(
                "variable `{}` starts at {}, expected {}",
                var.name, var.offset, next
            )));
        }
        next += var.size;
    }
    Ok(())
}

/// Picks the most competent step method for each variable.
#[derive(Debug, Clone)]
pub struct CompetenceRegistry {
    /// Candidates in order of preference if competences tie.
    methods: Vec<StepMethodKind>,
}

impl Default for CompetenceRegistry {
    fn default() -> Self {
        CompetenceRegistry {
            methods: vec![
                StepMethodKind::Nuts,
                StepMethodKind::Hmc,
                StepMethodKind::BinaryMetropolis,
                StepMethodKind::Metropolis,
            ],
        }
    }
}

impl CompetenceRegistry {
    pub fn new(methods: Vec<StepMethodKind>) -> Self {
        CompetenceRegistry { methods }
    }

    /// The most competent method, `None` if no method is compatible.
    pub fn select(&self, variable: &VariableDescriptor) -> Option<StepMethodKind> {
        let mut best: Option<(StepMethodKind, Competence)> = None;
        for &method in self.methods.iter() {
            let competence = method.competence(variable);
            if competence == Competence::Incompatible {
                continue;
            }
            if best.is_none_or(|(_, current)| competence > current) {
                best = Some((method, competence));
            }
        }
        best.map(|(method, _)| method)
    }

    /// Split the variables into blocks, one per step method.
    ///
    /// Variables in `overrides` are assigned first, every other variable goes
    /// to the most competent method. Variables with the same automatically
    /// chosen method share one block.
    pub fn assign(
        &self,
        dim: usize,
        variables: &[VariableInfo],
        has_gradient: bool,
        overrides: &[StepAssignment],
    ) -> Result<Vec<BlockAssignment>> {
        validate_layout(dim, variables)?;

        let descriptor = |var: &VariableInfo| VariableDescriptor {
            support: var.support,
            has_gradient,
        };

        let mut assigned: HashSet<&str> = HashSet::new();
        let mut blocks = vec![];
        for assignment in overrides.iter() {
            if assignment.variables.is_empty() {
                return Err(SamplerError::InvalidSettings(format!(
                    "step method assignment for {} has no variables",
                    assignment.method
                )));
            }
            let mut block = BlockAssignment {
                method: assignment.method,
                variables: vec![],
                indices: vec![],
            };
            for name in assignment.variables.iter() {
                let var = variables
                    .iter()
                    .find(|var| &var.name == name)
                    .ok_or_else(|| SamplerError::UnknownVariable(name.clone()))?;
                if !assigned.insert(var.name.as_str()) {
                    return Err(SamplerError::DuplicateAssignment(name.clone()));
                }
                if assignment.method.competence(&descriptor(var)) == Competence::Incompatible {
                    return Err(SamplerError::IncompatibleStepMethod {
                        method: assignment.method,
                        variable: name.clone(),
                    });
                }
                block.variables.push(var.name.clone());
                block.indices.extend(var.indices());
            }
            blocks.push(block);
        }

        let mut automatic: BTreeMap<StepMethodKind, BlockAssignment> = BTreeMap::new();
        for var in variables.iter() {
            if assigned.contains(var.name.as_str()) {
                continue;
            }
            let method = self.select(&descriptor(var)).ok_or_else(|| {
                SamplerError::InvalidSettings(format!(
                    "no step method can sample variable `{}`",
                    var.name
                ))
            })?;
            let block = automatic.entry(method).or_insert_with(|| BlockAssignment {
                method,
                variables: vec![],
                indices: vec![],
            });
            block.variables.push(var.name.clone());
            block.indices.extend(var.indices());
        }
        blocks.extend(automatic.into_values());
        Ok(blocks)
    }
}
