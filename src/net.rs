//! The net: derives an execution order from its roots and drives forward, backward and update

use std::collections::HashSet;

use crate::{
    graph::{DataId, Graph, GraphError, ModuleId},
    optim::{Optim, OptimizerConfig},
    tensor::Tensor,
};

/// Explicit training configuration of a [`Net`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetConfig {
    pub learning_rate: f32,
    pub optimizer: OptimizerConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            optimizer: OptimizerConfig::default(),
        }
    }
}

fn check_learning_rate(rate: f32) -> Result<(), GraphError> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(GraphError::InvalidArgument(format!(
            "learning rate must be positive, got {}",
            rate
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Owns a graph and the fixed order in which its modules run
pub struct Net {
    name: String,
    graph: Graph,
    roots: Vec<DataId>,
    /// every module reachable from the roots, producers before consumers
    order: Vec<ModuleId>,
    /// every data node touched by `order`, plus the roots
    nodes: Vec<DataId>,
    learning_rate: f32,
    optimizer: Box<dyn Optim>,
}

impl Net {
    /// Builds a net with the default configuration (Adam)
    pub fn new(name: &str, graph: Graph, roots: &[DataId]) -> Result<Self, GraphError> {
        Self::with_config(name, graph, roots, NetConfig::default())
    }

    pub fn with_config(
        name: &str,
        graph: Graph,
        roots: &[DataId],
        config: NetConfig,
    ) -> Result<Self, GraphError> {
        check_learning_rate(config.learning_rate)?;
        if roots.is_empty() {
            return Err(GraphError::InvalidArgument(format!(
                "net '{}' needs at least one root",
                name
            )));
        }
        if let Some(root) = roots.iter().find(|r| graph.get(**r).is_none()) {
            return Err(GraphError::InvalidArgument(format!(
                "root {:?} is not a node of the graph",
                root
            )));
        }
        // a repeated root would be seeded twice
        let mut unique = HashSet::new();
        let roots = roots
            .iter()
            .copied()
            .filter(|r| unique.insert(*r))
            .collect::<Vec<_>>();

        let order = topological_order(&graph, &roots)?;
        let mut seen = HashSet::new();
        let nodes = roots
            .iter()
            .copied()
            .chain(order.iter().flat_map(|&m| {
                let module = &graph[m];
                module
                    .operands()
                    .chain(std::iter::once(module.output()))
                    .collect::<Vec<_>>()
            }))
            .filter(|id| seen.insert(*id))
            .collect::<Vec<_>>();

        log::debug!(
            "net '{}': execution order [{}]",
            name,
            order
                .iter()
                .map(|&m| graph[m].name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            name: name.to_string(),
            graph,
            roots,
            order,
            nodes,
            learning_rate: config.learning_rate,
            optimizer: config.optimizer.build(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn roots(&self) -> &[DataId] {
        &self.roots
    }

    /// Modules in execution order
    pub fn order(&self) -> &[ModuleId] {
        &self.order
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, rate: f32) -> Result<(), GraphError> {
        check_learning_rate(rate)?;
        self.learning_rate = rate;
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<DataId> {
        self.graph.find(name)
    }

    pub fn set_value(&mut self, id: DataId, value: Tensor) -> Result<(), GraphError> {
        self.graph.set_value(id, value)
    }

    pub fn value(&self, id: DataId) -> Option<&Tensor> {
        self.graph.get(id).and_then(|n| n.value())
    }

    pub fn grad(&self, id: DataId) -> Option<&Tensor> {
        self.graph.get(id).map(|n| n.grad())
    }

    /// Trainable parameters of the modules this net runs
    pub fn parameters(&self) -> Vec<DataId> {
        self.order
            .iter()
            .flat_map(|&m| self.graph[m].params().iter().copied())
            .collect()
    }

    /// Evaluates every module in order. Stops at the first module with an unset operand;
    /// modules after it are left untouched.
    pub fn forward(&mut self) -> Result<(), GraphError> {
        for &module in &self.order {
            self.graph.run_forward(module)?;
        }
        Ok(())
    }

    /// Backpropagates from the roots, which must each hold a single value
    pub fn backward(&mut self) -> Result<(), GraphError> {
        let seeds = self
            .roots
            .iter()
            .map(|&root| {
                let node = &self.graph[root];
                if node.shape().iter().product::<usize>() != 1 {
                    return Err(GraphError::InvalidArgument(format!(
                        "root '{}' has shape {:?}; use backward_with_seeds for non-scalar roots",
                        node.name(),
                        node.shape()
                    )));
                }
                Ok((root, Tensor::new(node.shape(), vec![1.0])?))
            })
            .collect::<Result<Vec<_>, GraphError>>()?;
        self.backward_with_seeds(&seeds)
    }

    /// Backpropagates with a caller-supplied seed gradient for every root.
    /// Each root takes exactly one seed.
    pub fn backward_with_seeds(&mut self, seeds: &[(DataId, Tensor)]) -> Result<(), GraphError> {
        let mut seeded = HashSet::new();
        if let Some((id, _)) = seeds.iter().find(|(id, _)| !seeded.insert(*id)) {
            return Err(GraphError::InvalidArgument(format!(
                "more than one seed given for {:?}",
                id
            )));
        }
        for root in &self.roots {
            if !seeds.iter().any(|(id, _)| id == root) {
                return Err(GraphError::InvalidArgument(format!(
                    "no seed gradient for root '{}'",
                    self.graph[*root].name()
                )));
            }
        }
        if let Some((id, _)) = seeds.iter().find(|(id, _)| !self.roots.contains(id)) {
            return Err(GraphError::InvalidArgument(format!(
                "seed given for {:?}, which is not a root",
                id
            )));
        }

        for &id in &self.nodes {
            self.graph.node_mut(id)?.reset_gradient();
        }
        for (root, seed) in seeds {
            self.graph.node_mut(*root)?.accumulate_gradient(seed)?;
        }
        for &module in self.order.iter().rev() {
            self.graph.run_backward(module)?;
        }
        Ok(())
    }

    /// Applies one optimizer step to every parameter
    pub fn update(&mut self) -> Result<(), GraphError> {
        for param in self.parameters() {
            let node = self.graph.node_mut(param)?;
            let name = node.name().to_string();
            let (value, grad) = node.value_and_grad_mut();
            let value = value.ok_or(GraphError::UnsetInput { name })?;
            self.optimizer.step(param, value, grad, self.learning_rate);
        }
        Ok(())
    }

    /// Forgets the optimizer's per-parameter state
    pub fn reset_optimizer(&mut self) {
        self.optimizer.reset();
    }
}

/// Post-order depth-first walk from the roots: a module is emitted after the producers
/// of all its operands. Reaching a module that is still being expanded means a cycle.
/// The walk keeps its own stack, so the depth of the graph is not bounded by the call stack.
fn topological_order(graph: &Graph, roots: &[DataId]) -> Result<Vec<ModuleId>, GraphError> {
    let producers = |module: ModuleId| {
        graph[module]
            .operands()
            .filter_map(|operand| graph[operand].producer())
            .collect::<Vec<_>>()
            .into_iter()
    };

    let mut marks = vec![Mark::Unvisited; graph.n_modules()];
    let mut order = vec![];
    for &root in roots {
        let Some(start) = graph[root].producer() else {
            continue;
        };
        if marks[start.0] == Mark::Done {
            continue;
        }
        marks[start.0] = Mark::InProgress;
        // (module being expanded, producers still to visit)
        let mut stack = vec![(start, producers(start))];
        while let Some((module, pending)) = stack.last_mut() {
            let module = *module;
            match pending.next() {
                Some(producer) => match marks[producer.0] {
                    Mark::Done => {}
                    Mark::InProgress => {
                        return Err(GraphError::CyclicGraph {
                            module: graph[producer].name().to_string(),
                        });
                    }
                    Mark::Unvisited => {
                        marks[producer.0] = Mark::InProgress;
                        stack.push((producer, producers(producer)));
                    }
                },
                None => {
                    marks[module.0] = Mark::Done;
                    order.push(module);
                    stack.pop();
                }
            }
        }
    }
    Ok(order)
}
