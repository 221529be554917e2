//! Pipeline registration: turns a submitted [`PipelineSpec`] into an
//! immutable [`PipelineGraph`] after checking every structural invariant the
//! executor relies on.
//!
//! A graph that passes [`PipelineGraph::build`] is guaranteed to fire every
//! stage exactly once for any request carrying all declared inputs: every
//! consumed tensor has exactly one source and the stage dependencies are
//! acyclic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use trytune_core::{PipelineSpec, PortSpec, TensorBinding};

use crate::{ModuleDescriptor, ModuleRegistry, RegistrationError};

#[derive(Debug)]
pub struct Stage {
    pub name: String,
    /// Descriptor snapshot taken at registration.
    pub module: Arc<ModuleDescriptor>,
    pub inputs: BTreeMap<String, TensorBinding>,
    pub outputs: BTreeMap<String, TensorBinding>,
}

#[derive(Debug)]
pub struct PipelineGraph {
    pub name: String,
    pub spec: PipelineSpec,
    pub stages: Vec<Stage>,
    /// Contract used to decode each declared input from a request.
    pub inputs: BTreeMap<String, PortSpec>,
    pub outputs: Vec<String>,
}

impl PipelineGraph {
    pub fn build(spec: PipelineSpec, modules: &ModuleRegistry) -> Result<Self, RegistrationError> {
        if spec.name.is_empty() {
            return Err(RegistrationError::EmptyName { kind: "pipeline" });
        }

        let mut stage_names = HashSet::new();
        let mut stages = Vec::with_capacity(spec.stages.len());
        for stage in &spec.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(RegistrationError::DuplicateStage(stage.name.clone()));
            }
            let module = modules
                .get(&stage.module)
                .ok_or_else(|| RegistrationError::UnknownModule {
                    stage: stage.name.clone(),
                    module: stage.module.clone(),
                })?;

            check_ports(&stage.name, &module, &stage.inputs, &module.spec().inputs, "input")?;
            check_ports(&stage.name, &module, &stage.outputs, &module.spec().outputs, "output")?;
            for binding in stage.inputs.values().chain(stage.outputs.values()) {
                check_reshape(&stage.name, binding)?;
            }

            stages.push(Stage {
                name: stage.name.clone(),
                module,
                inputs: stage.inputs.clone(),
                outputs: stage.outputs.clone(),
            });
        }

        let producers = producers(&stages)?;

        for tensor in &spec.inputs {
            if let Some(stage) = producers.get(tensor.as_str()) {
                return Err(RegistrationError::ProducedInput {
                    tensor: tensor.clone(),
                    stage: stages[*stage].name.clone(),
                });
            }
        }
        for tensor in &spec.outputs {
            if !producers.contains_key(tensor.as_str()) {
                return Err(RegistrationError::UnproducedOutput(tensor.clone()));
            }
        }

        let declared: HashSet<&str> = spec.inputs.iter().map(String::as_str).collect();
        for stage in &stages {
            for binding in stage.inputs.values() {
                let tensor = binding.tensor.as_str();
                if !declared.contains(tensor) && !producers.contains_key(tensor) {
                    return Err(RegistrationError::Unreachable {
                        stage: stage.name.clone(),
                        tensor: tensor.to_string(),
                    });
                }
            }
        }

        detect_cycles(&stages, &producers)?;
        let inputs = input_contracts(&spec.inputs, &stages)?;

        Ok(Self {
            name: spec.name.clone(),
            outputs: spec.outputs.clone(),
            inputs,
            stages,
            spec,
        })
    }
}

fn check_ports(
    stage: &str,
    module: &ModuleDescriptor,
    bindings: &BTreeMap<String, TensorBinding>,
    ports: &[PortSpec],
    direction: &'static str,
) -> Result<(), RegistrationError> {
    for port in ports {
        if !bindings.contains_key(&port.name) {
            return Err(RegistrationError::UnboundPort {
                stage: stage.to_string(),
                module: module.name.clone(),
                port: port.name.clone(),
                direction,
            });
        }
    }
    for port in bindings.keys() {
        if !ports.iter().any(|p| &p.name == port) {
            return Err(RegistrationError::UnknownPort {
                stage: stage.to_string(),
                module: module.name.clone(),
                port: port.clone(),
                direction,
            });
        }
    }
    Ok(())
}

fn check_reshape(stage: &str, binding: &TensorBinding) -> Result<(), RegistrationError> {
    let Some(shape) = &binding.reshape else {
        return Ok(());
    };
    let dynamic = shape.iter().filter(|d| **d == -1).count();
    if dynamic > 1 || shape.iter().any(|d| *d < -1) {
        return Err(RegistrationError::InvalidReshape {
            stage: stage.to_string(),
            tensor: binding.tensor.clone(),
            shape: shape.clone(),
        });
    }
    Ok(())
}

/// Tensor name → index of the only stage producing it.
fn producers(stages: &[Stage]) -> Result<HashMap<&str, usize>, RegistrationError> {
    let mut producers = HashMap::new();
    for (idx, stage) in stages.iter().enumerate() {
        for binding in stage.outputs.values() {
            if let Some(first) = producers.insert(binding.tensor.as_str(), idx) {
                return Err(RegistrationError::DuplicateProducer {
                    tensor: binding.tensor.clone(),
                    first: stages[first].name.clone(),
                    second: stage.name.clone(),
                });
            }
        }
    }
    Ok(producers)
}

fn detect_cycles(stages: &[Stage], producers: &HashMap<&str, usize>) -> Result<(), RegistrationError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    // Edges run from a stage to the stages producing its inputs.
    let upstream: Vec<Vec<usize>> = stages
        .iter()
        .map(|stage| {
            stage
                .inputs
                .values()
                .filter_map(|b| producers.get(b.tensor.as_str()).copied())
                .collect()
        })
        .collect();

    fn visit(
        node: usize,
        upstream: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Result<(), Vec<usize>> {
        colors[node] = Color::Gray;
        path.push(node);
        for &next in &upstream[node] {
            match colors[next] {
                Color::Gray => {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Err(cycle);
                }
                Color::White => visit(next, upstream, colors, path)?,
                Color::Black => {}
            }
        }
        path.pop();
        colors[node] = Color::Black;
        Ok(())
    }

    let mut colors = vec![Color::White; stages.len()];
    let mut path = Vec::new();
    for node in 0..stages.len() {
        if colors[node] == Color::White {
            if let Err(cycle) = visit(node, &upstream, &mut colors, &mut path) {
                // Reverse so the path reads in data-flow order.
                let names: Vec<&str> = cycle.iter().rev().map(|i| stages[*i].name.as_str()).collect();
                return Err(RegistrationError::Cycle(names.join(" → ")));
            }
        }
    }
    Ok(())
}

fn input_contracts(
    declared: &[String],
    stages: &[Stage],
) -> Result<BTreeMap<String, PortSpec>, RegistrationError> {
    let mut contracts: BTreeMap<String, PortSpec> = BTreeMap::new();
    for tensor in declared {
        for stage in stages {
            for (port_name, binding) in &stage.inputs {
                if &binding.tensor != tensor {
                    continue;
                }
                let Some(port) = stage.module.spec().input(port_name) else {
                    continue;
                };
                match contracts.get(tensor) {
                    Some(existing) if existing.dtype != port.dtype => {
                        return Err(RegistrationError::ConflictingInput {
                            tensor: tensor.clone(),
                            first: existing.dtype,
                            second: port.dtype,
                        });
                    }
                    Some(_) => {}
                    None => {
                        // A reshaping binding decides the shape itself; take the data flat.
                        let dims = match binding.reshape {
                            Some(_) => vec![None],
                            None => port.dims.clone(),
                        };
                        contracts.insert(tensor.clone(), PortSpec::new(tensor, port.dtype, dims));
                    }
                }
            }
        }
        if !contracts.contains_key(tensor) {
            return Err(RegistrationError::UnusedInput(tensor.clone()));
        }
    }
    Ok(contracts)
}
