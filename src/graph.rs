//! Data and module nodes, stored in an arena and wired by index
use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display},
    ops::Index,
};

use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    operation::{self, Init, OpKind},
    tensor::{Tensor, TensorError},
};

/// Errors raised while building or running a computation graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Value of shape {got:?} does not match the declared shape {expected:?} of '{name}'")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Module '{module}' is wired incorrectly: {reason}")]
    IncompatibleShape { module: String, reason: String },
    #[error("The graph contains a cycle through module '{module}'")]
    CyclicGraph { module: String },
    #[error("'{name}' has no value")]
    UnsetInput { name: String },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Handle to a data node of a [`Graph`]
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataId(pub(crate) usize);

/// Handle to a module of a [`Graph`]
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModuleId(pub(crate) usize);

/// A named tensor and its accumulated gradient
#[derive(Debug)]
pub struct DataNode {
    name: String,
    shape: Vec<usize>,
    value: Option<Tensor>,
    grad: Tensor,
    /// `None` for leaves: inputs, targets and parameters
    producer: Option<ModuleId>,
    consumers: Vec<ModuleId>,
    trainable: bool,
}

impl DataNode {
    fn new(name: String, shape: &[usize], trainable: bool) -> Result<Self, GraphError> {
        let grad = Tensor::zeros(shape)
            .map_err(|e| GraphError::InvalidArgument(format!("shape of '{}': {}", name, e)))?;
        Ok(Self {
            name,
            shape: shape.to_vec(),
            value: None,
            grad,
            producer: None,
            consumers: vec![],
            trainable,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn check_shape(&self, t: &Tensor) -> Result<(), GraphError> {
        if t.shape() != self.shape.as_slice() {
            return Err(GraphError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.shape.clone(),
                got: t.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Stores a value. On a shape mismatch the current value is kept.
    pub fn set(&mut self, value: Tensor) -> Result<(), GraphError> {
        self.check_shape(&value)?;
        self.value = Some(value);
        Ok(())
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    pub fn grad(&self) -> &Tensor {
        &self.grad
    }

    /// Adds `delta` into the gradient, so a node feeding several modules sums their contributions
    pub fn accumulate_gradient(&mut self, delta: &Tensor) -> Result<(), GraphError> {
        self.check_shape(delta)?;
        self.grad.add_assign(delta)?;
        Ok(())
    }

    pub fn reset_gradient(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn producer(&self) -> Option<ModuleId> {
        self.producer
    }

    pub fn consumers(&self) -> &[ModuleId] {
        &self.consumers
    }

    /// Whether the node is a parameter owned by a module
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub(crate) fn value_and_grad_mut(&mut self) -> (Option<&mut Tensor>, &Tensor) {
        (self.value.as_mut(), &self.grad)
    }
}

/// A function node: reads its inputs and parameters, writes its output
#[derive(Debug)]
pub struct ModuleNode {
    name: String,
    kind: OpKind,
    inputs: Vec<DataId>,
    params: Vec<DataId>,
    output: DataId,
}

impl ModuleNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn inputs(&self) -> &[DataId] {
        &self.inputs
    }

    /// Parameters owned by this module, e.g. weight and bias for MatMul
    pub fn params(&self) -> &[DataId] {
        &self.params
    }

    pub fn output(&self) -> DataId {
        self.output
    }

    /// Inputs followed by parameters, the order the operation rules expect
    pub fn operands(&self) -> impl Iterator<Item = DataId> + '_ {
        self.inputs.iter().chain(self.params.iter()).copied()
    }
}

/// Arena holding every data node and module of a computation graph
#[derive(Debug)]
pub struct Graph {
    data: Vec<DataNode>,
    modules: Vec<ModuleNode>,
    names: HashMap<String, DataId>,
    module_names: HashSet<String>,
    rng: Pcg64Mcg,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<DataId> for Graph {
    type Output = DataNode;

    fn index(&self, index: DataId) -> &Self::Output {
        &self.data[index.0]
    }
}

impl Index<ModuleId> for Graph {
    type Output = ModuleNode;

    fn index(&self, index: ModuleId) -> &Self::Output {
        &self.modules[index.0]
    }
}

impl Graph {
    /// Creates an empty graph whose parameters are initialized from fresh entropy
    pub fn new() -> Self {
        Self::with_rng(Pcg64Mcg::from_rng(&mut rand::rng()))
    }

    /// Creates an empty graph with reproducible parameter initialization
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(Pcg64Mcg::seed_from_u64(seed))
    }

    fn with_rng(rng: Pcg64Mcg) -> Self {
        Self {
            data: vec![],
            modules: vec![],
            names: HashMap::new(),
            module_names: HashSet::new(),
            rng,
        }
    }

    fn insert_data(
        &mut self,
        name: &str,
        shape: &[usize],
        trainable: bool,
    ) -> Result<DataId, GraphError> {
        if self.names.contains_key(name) {
            return Err(GraphError::InvalidArgument(format!(
                "a data node named '{}' already exists",
                name
            )));
        }
        let node = DataNode::new(name.to_string(), shape, trainable)?;
        let id = DataId(self.data.len());
        self.data.push(node);
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Declares a data node with a fixed shape
    pub fn add_data(&mut self, name: &str, shape: &[usize]) -> Result<DataId, GraphError> {
        self.insert_data(name, shape, false)
    }

    /// Wires a module of `kind` from `inputs` to `output`, creating the parameters it owns.
    ///
    /// Parameters are named `<module>.<suffix>`, e.g. `m1.weight`.
    pub fn add_module(
        &mut self,
        name: &str,
        kind: OpKind,
        inputs: &[DataId],
        output: DataId,
    ) -> Result<ModuleId, GraphError> {
        if self.module_names.contains(name) {
            return Err(GraphError::InvalidArgument(format!(
                "a module named '{}' already exists",
                name
            )));
        }
        for &id in inputs.iter().chain(std::iter::once(&output)) {
            if id.0 >= self.data.len() {
                return Err(GraphError::InvalidArgument(format!(
                    "module '{}' refers to a data node of another graph",
                    name
                )));
            }
        }
        let out = &self.data[output.0];
        if out.trainable {
            return Err(GraphError::InvalidArgument(format!(
                "module '{}' cannot write into parameter '{}'",
                name, out.name
            )));
        }
        if let Some(producer) = out.producer {
            return Err(GraphError::InvalidArgument(format!(
                "'{}' is already produced by module '{}'",
                out.name, self.modules[producer.0].name
            )));
        }

        let input_shapes = inputs
            .iter()
            .map(|id| self.data[id.0].shape.as_slice())
            .collect::<Vec<_>>();
        let param_specs = kind
            .check_wiring(&input_shapes, &out.shape)
            .map_err(|reason| GraphError::IncompatibleShape {
                module: name.to_string(),
                reason,
            })?;
        if let Some(spec) = param_specs
            .iter()
            .find(|spec| self.names.contains_key(&format!("{}.{}", name, spec.suffix)))
        {
            return Err(GraphError::InvalidArgument(format!(
                "parameter name '{}.{}' is already taken",
                name, spec.suffix
            )));
        }

        let id = ModuleId(self.modules.len());
        let mut params = Vec::with_capacity(param_specs.len());
        for spec in param_specs {
            let param_name = format!("{}.{}", name, spec.suffix);
            let param = self.insert_data(&param_name, &spec.shape, true)?;
            let value = self.init_tensor(&spec.shape, spec.init)?;
            self.data[param.0].set(value)?;
            self.data[param.0].consumers.push(id);
            params.push(param);
        }
        for input in inputs {
            self.data[input.0].consumers.push(id);
        }
        self.data[output.0].producer = Some(id);
        self.modules.push(ModuleNode {
            name: name.to_string(),
            kind,
            inputs: inputs.to_vec(),
            params,
            output,
        });
        self.module_names.insert(name.to_string());
        log::debug!("wired {} module '{}'", kind, name);
        Ok(id)
    }

    /// `output = input . weight + bias`
    pub fn matmul(
        &mut self,
        name: &str,
        input: DataId,
        output: DataId,
    ) -> Result<ModuleId, GraphError> {
        self.add_module(name, OpKind::MatMul, &[input], output)
    }

    pub fn relu(
        &mut self,
        name: &str,
        input: DataId,
        output: DataId,
    ) -> Result<ModuleId, GraphError> {
        self.add_module(name, OpKind::Relu, &[input], output)
    }

    pub fn mse_loss(
        &mut self,
        name: &str,
        prediction: DataId,
        target: DataId,
        output: DataId,
    ) -> Result<ModuleId, GraphError> {
        self.add_module(name, OpKind::MseLoss, &[prediction, target], output)
    }

    fn init_tensor(&mut self, shape: &[usize], init: Init) -> Result<Tensor, GraphError> {
        match init {
            Init::Zeros => Ok(Tensor::zeros(shape)?),
            Init::HeNormal { fan_in } => {
                // keeps the variance of activations roughly constant through ReLU layers
                let std = (2.0 / fan_in as f32).sqrt();
                let normal = Normal::new(0.0, std)
                    .map_err(|e| GraphError::InvalidArgument(format!("initialization: {}", e)))?;
                let len = shape.iter().product();
                let data = (0..len).map(|_| normal.sample(&mut self.rng)).collect();
                Ok(Tensor::new(shape, data)?)
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<DataId> {
        self.names.get(name).copied()
    }

    pub fn get(&self, id: DataId) -> Option<&DataNode> {
        self.data.get(id.0)
    }

    pub(crate) fn node_mut(&mut self, id: DataId) -> Result<&mut DataNode, GraphError> {
        self.data
            .get_mut(id.0)
            .ok_or_else(|| GraphError::InvalidArgument(format!("unknown data node {:?}", id)))
    }

    pub fn module(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.modules.get(id.0)
    }

    pub fn n_data(&self) -> usize {
        self.data.len()
    }

    pub fn n_modules(&self) -> usize {
        self.modules.len()
    }

    /// Every parameter of every module, in wiring order
    pub fn parameters(&self) -> Vec<DataId> {
        self.modules.iter().flat_map(|m| m.params.iter().copied()).collect()
    }

    /// Stores a value on a data node, checking its shape
    pub fn set_value(&mut self, id: DataId, value: Tensor) -> Result<(), GraphError> {
        self.node_mut(id)?.set(value)
    }

    /// Runs the forward rule of a module, writing its output value
    pub(crate) fn run_forward(&mut self, id: ModuleId) -> Result<(), GraphError> {
        let module = &self.modules[id.0];
        let output = {
            let operands = module
                .operands()
                .map(|d| {
                    let node = &self.data[d.0];
                    node.value.as_ref().ok_or_else(|| GraphError::UnsetInput {
                        name: node.name.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            operation::forward(module.kind, &operands)?
        };
        let out = &mut self.data[module.output.0];
        let shape = out.shape.clone();
        out.set(output.reshape(&shape)?)
    }

    /// Runs the backward rule of a module with the gradient accumulated on its output
    pub(crate) fn run_backward(&mut self, id: ModuleId) -> Result<(), GraphError> {
        let module = &self.modules[id.0];
        let grads = {
            let operands = module
                .operands()
                .map(|d| {
                    let node = &self.data[d.0];
                    node.value.as_ref().ok_or_else(|| GraphError::UnsetInput {
                        name: node.name.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let out_grad = &self.data[module.output.0].grad;
            operation::backward(module.kind, &operands, out_grad)?
        };
        for (operand, grad) in module.operands().zip(grads) {
            if let Some(grad) = grad {
                self.data[operand.0].accumulate_gradient(&grad)?;
            }
        }
        Ok(())
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.modules {
            let names = |ids: &[DataId]| {
                ids.iter()
                    .map(|id| self.data[id.0].name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            writeln!(
                f,
                "{} {}([{}]; params [{}]) -> {}",
                m.kind,
                m.name,
                names(&m.inputs),
                names(&m.params),
                self.data[m.output.0].name
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_shape_mismatch_keeps_value() {
        let mut graph = Graph::seeded(0);
        let x = graph.add_data("x", &[1, 3]).unwrap();
        let wrong = Tensor::zeros(&[2, 3]).unwrap();
        let err = graph.set_value(x, wrong.clone()).unwrap_err();
        assert!(matches!(
            err,
            GraphError::ShapeMismatch { ref name, ref expected, ref got }
                if name == "x" && expected == &[1, 3] && got == &[2, 3]
        ));
        assert!(graph[x].value().is_none());

        let good = Tensor::new(&[1, 3], vec![1.0, 2.0, 3.0]).unwrap();
        graph.set_value(x, good.clone()).unwrap();
        assert!(graph.set_value(x, wrong).is_err());
        assert_eq!(graph[x].value(), Some(&good));
    }

    #[test]
    fn test_accumulate_and_reset_gradient() {
        let mut graph = Graph::seeded(0);
        let x = graph.add_data("x", &[1, 2]).unwrap();
        let node = graph.node_mut(x).unwrap();
        let delta = Tensor::new(&[1, 2], vec![1.0, -2.0]).unwrap();
        node.accumulate_gradient(&delta).unwrap();
        node.accumulate_gradient(&delta).unwrap();
        assert_eq!(node.grad().data(), &[2.0, -4.0]);
        assert!(node.accumulate_gradient(&Tensor::scalar(1.0)).is_err());
        node.reset_gradient();
        assert_eq!(node.grad().data(), &[0.0, 0.0]);
    }

    #[test]
    fn test_duplicate_and_invalid_data() {
        let mut graph = Graph::seeded(0);
        graph.add_data("x", &[1, 3]).unwrap();
        assert!(matches!(
            graph.add_data("x", &[1, 3]),
            Err(GraphError::InvalidArgument(_))
        ));
        assert!(matches!(
            graph.add_data("empty", &[]),
            Err(GraphError::InvalidArgument(_))
        ));
        assert!(matches!(
            graph.add_data("zero", &[1, 0]),
            Err(GraphError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_matmul_creates_parameters() {
        let mut graph = Graph::seeded(7);
        let x = graph.add_data("x", &[1, 3]).unwrap();
        let z = graph.add_data("z", &[1, 5]).unwrap();
        let m = graph.matmul("m1", x, z).unwrap();

        let weight = graph.find("m1.weight").unwrap();
        let bias = graph.find("m1.bias").unwrap();
        assert_eq!(graph[m].params(), &[weight, bias]);
        assert_eq!(graph[weight].shape(), &[3, 5]);
        assert_eq!(graph[bias].shape(), &[1, 5]);
        assert!(graph[weight].is_trainable());
        assert!(graph[weight].value().unwrap().data().iter().any(|&v| v != 0.0));
        assert!(graph[bias].value().unwrap().data().iter().all(|&v| v == 0.0));
        assert_eq!(graph[z].producer(), Some(m));
        assert_eq!(graph[x].consumers(), &[m]);
        assert_eq!(graph.parameters(), vec![weight, bias]);
    }

    #[test]
    fn test_seeded_initialization_is_reproducible() {
        let build = || {
            let mut graph = Graph::seeded(42);
            let x = graph.add_data("x", &[1, 3]).unwrap();
            let z = graph.add_data("z", &[1, 5]).unwrap();
            graph.matmul("m1", x, z).unwrap();
            let w = graph.find("m1.weight").unwrap();
            graph[w].value().unwrap().clone()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_incompatible_wiring() {
        let mut graph = Graph::seeded(0);
        let x = graph.add_data("x", &[1, 3]).unwrap();
        let z = graph.add_data("z", &[2, 5]).unwrap();
        let a = graph.add_data("a", &[1, 4]).unwrap();
        assert!(matches!(
            graph.matmul("m1", x, z),
            Err(GraphError::IncompatibleShape { ref module, .. }) if module == "m1"
        ));
        assert!(matches!(
            graph.relu("r", x, a),
            Err(GraphError::IncompatibleShape { .. })
        ));
        assert!(matches!(
            graph.add_module("r", OpKind::Relu, &[x, x], a),
            Err(GraphError::IncompatibleShape { .. })
        ));
        // failed wiring leaves no trace
        assert_eq!(graph.n_modules(), 0);
        assert!(graph.find("m1.weight").is_none());
        assert!(graph[x].consumers().is_empty());
    }

    #[test]
    fn test_output_has_single_producer() {
        let mut graph = Graph::seeded(0);
        let x = graph.add_data("x", &[1, 3]).unwrap();
        let a = graph.add_data("a", &[1, 3]).unwrap();
        graph.relu("r1", x, a).unwrap();
        assert!(matches!(
            graph.relu("r2", x, a),
            Err(GraphError::InvalidArgument(_))
        ));
        assert!(matches!(
            graph.relu("r1", a, x),
            Err(GraphError::InvalidArgument(_))
        ));
        let z = graph.add_data("z", &[1, 2]).unwrap();
        graph.matmul("m", x, z).unwrap();
        let w = graph.find("m.weight").unwrap();
        let y = graph.add_data("y", &[3, 2]).unwrap();
        assert!(matches!(
            graph.relu("r3", y, w),
            Err(GraphError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_display_lists_modules() {
        let mut graph = Graph::seeded(0);
        let x = graph.add_data("x", &[1, 3]).unwrap();
        let a = graph.add_data("a", &[1, 3]).unwrap();
        graph.relu("act", x, a).unwrap();
        assert_eq!(graph.to_string(), "Relu act([x]; params []) -> a\n");
    }
}
