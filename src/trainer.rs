//! The tutorial network and its training loop

use rand::Rng;
use thiserror::Error;

use crate::{
    dataloader::{DataLoader, DataLoaderError},
    graph::{DataId, Graph, GraphError},
    net::{Net, NetConfig},
    tensor::Tensor,
};

/// Errors surfaced while training
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Data(#[from] DataLoaderError),
    #[error("Report interval must be positive")]
    InvalidReportInterval,
}

/// `x -> MatMul -> z1 -> Relu -> a -> MatMul -> z2`, `loss = MSE(z2, y)`
pub struct RegressionModel {
    pub net: Net,
    pub x: DataId,
    pub y: DataId,
    pub prediction: DataId,
    pub loss: DataId,
}

impl RegressionModel {
    pub fn build(
        batch_size: usize,
        n_features: usize,
        hidden: usize,
        config: NetConfig,
        seed: u64,
    ) -> Result<Self, GraphError> {
        let mut graph = Graph::seeded(seed);
        let x = graph.add_data("x", &[batch_size, n_features])?;
        let y = graph.add_data("y", &[batch_size, 1])?;
        let z1 = graph.add_data("z1", &[batch_size, hidden])?;
        let a = graph.add_data("a", &[batch_size, hidden])?;
        let z2 = graph.add_data("z2", &[batch_size, 1])?;
        let loss = graph.add_data("loss", &[1])?;
        graph.matmul("m1", x, z1)?;
        graph.relu("relu", z1, a)?;
        graph.matmul("m2", a, z2)?;
        graph.mse_loss("mse", z2, y, loss)?;
        log::debug!("regression graph:\n{}", graph);

        let net = Net::with_config("regression", graph, &[loss], config)?;
        Ok(Self {
            net,
            x,
            y,
            prediction: z2,
            loss,
        })
    }

    /// Sets inputs and targets, then runs forward, backward and update. Returns the loss.
    pub fn train_step(&mut self, inputs: Tensor, targets: Tensor) -> Result<f32, GraphError> {
        self.net.set_value(self.x, inputs)?;
        self.net.set_value(self.y, targets)?;
        self.net.forward()?;
        self.net.backward()?;
        self.net.update()?;
        self.loss()
    }

    /// Loss computed by the last forward pass
    pub fn loss(&self) -> Result<f32, GraphError> {
        self.net
            .value(self.loss)
            .and_then(|t| t.item())
            .ok_or_else(|| GraphError::UnsetInput {
                name: "loss".to_string(),
            })
    }
}

/// Mean cost over the `report_every` iterations ending at `iteration`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
    pub iteration: usize,
    pub cost: f32,
}

/// Runs `iterations` steps, each on a freshly sampled batch, reporting the mean cost
/// every `report_every` iterations
pub fn train<R: Rng>(
    model: &mut RegressionModel,
    loader: &DataLoader,
    iterations: usize,
    report_every: usize,
    rng: &mut R,
) -> Result<Vec<Checkpoint>, TrainError> {
    if report_every == 0 {
        return Err(TrainError::InvalidReportInterval);
    }
    let mut checkpoints = Vec::with_capacity(iterations / report_every);
    let mut window = 0.0;
    for i in 1..=iterations {
        let (inputs, targets) = loader.sample(rng)?;
        let loss = model.train_step(inputs, targets)?;
        if !loss.is_finite() {
            log::warn!("iteration {}: loss is {}", i, loss);
        }
        window += loss;
        if i % report_every == 0 {
            let cost = window / report_every as f32;
            log::info!("iteration: {}, cost: {}", i, cost);
            checkpoints.push(Checkpoint { iteration: i, cost });
            window = 0.0;
        }
    }
    Ok(checkpoints)
}
