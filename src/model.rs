// src/model.rs - Sequence model boundary and a stacked LSTM evaluator
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use tracing::info;

use crate::assembler::PoseSequence;
use crate::error::ModelError;

/// Anything that maps a (frames, features) sequence to class probabilities.
pub trait SequenceModel: Send + Sync {
    /// (frames, features) the model was trained on.
    fn input_shape(&self) -> (usize, usize);

    fn num_classes(&self) -> usize;

    fn predict(&self, sequence: &PoseSequence) -> Result<Vec<f32>, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Softmax,
    Linear,
}

/// One layer as stored in the weights file. Kernels use the Keras layout:
/// `kernel[input][unit]`, LSTM gates ordered i, f, c, o.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Lstm {
        units: usize,
        #[serde(default)]
        return_sequences: bool,
        kernel: Vec<Vec<f32>>,
        recurrent_kernel: Vec<Vec<f32>>,
        bias: Vec<f32>,
    },
    BatchNorm {
        gamma: Vec<f32>,
        beta: Vec<f32>,
        moving_mean: Vec<f32>,
        moving_variance: Vec<f32>,
        #[serde(default = "default_bn_epsilon")]
        epsilon: f32,
    },
    Dense {
        activation: Activation,
        kernel: Vec<Vec<f32>>,
        bias: Vec<f32>,
    },
}

fn default_bn_epsilon() -> f32 {
    1e-3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub input_shape: [usize; 2],
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone)]
enum Layer {
    Lstm {
        units: usize,
        return_sequences: bool,
        /// (4·units, input)
        w: DMatrix<f32>,
        /// (4·units, units)
        u: DMatrix<f32>,
        b: DVector<f32>,
    },
    BatchNorm {
        scale: DVector<f32>,
        shift: DVector<f32>,
    },
    Dense {
        activation: Activation,
        /// (units, input)
        w: DMatrix<f32>,
        b: DVector<f32>,
    },
}

enum Signal {
    Sequence(Vec<DVector<f32>>),
    Vector(DVector<f32>),
}

impl Signal {
    fn map(self, f: impl Fn(DVector<f32>) -> DVector<f32>) -> Signal {
        match self {
            Signal::Sequence(steps) => Signal::Sequence(steps.into_iter().map(f).collect()),
            Signal::Vector(v) => Signal::Vector(f(v)),
        }
    }
}

/// LSTM stack followed by normalization and dense layers, evaluated on the CPU.
#[derive(Debug, Clone)]
pub struct LstmNetwork {
    input_shape: (usize, usize),
    num_classes: usize,
    layers: Vec<Layer>,
}

impl LstmNetwork {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let file = File::open(path.as_ref())?;
        let spec: ModelFile = serde_json::from_reader(std::io::BufReader::new(file))?;
        let network = Self::from_file(spec)?;
        info!(
            "Loaded model from {} (input {:?}, {} classes, {} layers)",
            path.as_ref().display(),
            network.input_shape,
            network.num_classes,
            network.layers.len()
        );
        Ok(network)
    }

    pub fn from_file(spec: ModelFile) -> Result<Self, ModelError> {
        Self::from_layers((spec.input_shape[0], spec.input_shape[1]), spec.layers)
    }

    /// Checks every layer's dimensions against the one before it.
    pub fn from_layers(input_shape: (usize, usize), specs: Vec<LayerSpec>) -> Result<Self, ModelError> {
        let definition = |msg: String| ModelError::Definition(msg);

        let mut width = input_shape.1;
        let mut sequential = true;
        let mut layers = Vec::with_capacity(specs.len());

        for (index, spec) in specs.into_iter().enumerate() {
            let layer = match spec {
                LayerSpec::Lstm {
                    units,
                    return_sequences,
                    kernel,
                    recurrent_kernel,
                    bias,
                } => {
                    if !sequential {
                        return Err(definition(format!(
                            "layer {}: lstm needs a sequence but receives a vector",
                            index
                        )));
                    }
                    let w = keras_kernel(&kernel, width, 4 * units)
                        .map_err(|e| definition(format!("layer {} kernel: {}", index, e)))?;
                    let u = keras_kernel(&recurrent_kernel, units, 4 * units)
                        .map_err(|e| definition(format!("layer {} recurrent kernel: {}", index, e)))?;
                    let b = vector(bias, 4 * units)
                        .map_err(|e| definition(format!("layer {} bias: {}", index, e)))?;
                    width = units;
                    sequential = return_sequences;
                    Layer::Lstm {
                        units,
                        return_sequences,
                        w,
                        u,
                        b,
                    }
                }
                LayerSpec::BatchNorm {
                    gamma,
                    beta,
                    moving_mean,
                    moving_variance,
                    epsilon,
                } => {
                    let check = |v: Vec<f32>, name: &str| {
                        vector(v, width)
                            .map_err(|e| definition(format!("layer {} {}: {}", index, name, e)))
                    };
                    let gamma = check(gamma, "gamma")?;
                    let beta = check(beta, "beta")?;
                    let mean = check(moving_mean, "moving_mean")?;
                    let var = check(moving_variance, "moving_variance")?;
                    // y = gamma·(x − mean)/sqrt(var + eps) + beta folded into scale/shift
                    let scale = gamma.zip_map(&var, |g, v| g / (v + epsilon).sqrt());
                    let shift = beta - scale.component_mul(&mean);
                    Layer::BatchNorm { scale, shift }
                }
                LayerSpec::Dense {
                    activation,
                    kernel,
                    bias,
                } => {
                    let units = bias.len();
                    let w = keras_kernel(&kernel, width, units)
                        .map_err(|e| definition(format!("layer {} kernel: {}", index, e)))?;
                    let b = DVector::from_vec(bias);
                    width = units;
                    Layer::Dense { activation, w, b }
                }
            };
            layers.push(layer);
        }

        if sequential {
            return Err(definition(
                "network ends in a sequence; the last lstm must not return sequences".to_string(),
            ));
        }
        if width == 0 {
            return Err(definition("network has no outputs".to_string()));
        }

        Ok(Self {
            input_shape,
            num_classes: width,
            layers,
        })
    }

    fn forward(&self, sequence: &PoseSequence) -> Result<DVector<f32>, ModelError> {
        let (frames, features) = sequence.shape();
        if (frames, features) != self.input_shape {
            return Err(ModelError::Definition(format!(
                "input shape ({}, {}) does not match model input {:?}",
                frames, features, self.input_shape
            )));
        }

        let mut signal = Signal::Sequence(
            sequence
                .frames()
                .iter()
                .map(|f| DVector::from_column_slice(f.as_slice()))
                .collect(),
        );

        for layer in &self.layers {
            signal = match layer {
                Layer::Lstm {
                    units,
                    return_sequences,
                    w,
                    u,
                    b,
                } => {
                    let Signal::Sequence(steps) = signal else {
                        return Err(ModelError::Definition("lstm received a vector".to_string()));
                    };
                    run_lstm(&steps, *units, *return_sequences, w, u, b)
                }
                Layer::BatchNorm { scale, shift } => {
                    signal.map(|x| x.component_mul(scale) + shift)
                }
                Layer::Dense { activation, w, b } => {
                    let activation = *activation;
                    signal.map(|x| activate(w * x + b, activation))
                }
            };
        }

        match signal {
            Signal::Vector(v) => Ok(v),
            Signal::Sequence(_) => Err(ModelError::Definition(
                "network produced a sequence".to_string(),
            )),
        }
    }
}

impl SequenceModel for LstmNetwork {
    fn input_shape(&self) -> (usize, usize) {
        self.input_shape
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&self, sequence: &PoseSequence) -> Result<Vec<f32>, ModelError> {
        Ok(self.forward(sequence)?.iter().copied().collect())
    }
}

fn run_lstm(
    steps: &[DVector<f32>],
    units: usize,
    return_sequences: bool,
    w: &DMatrix<f32>,
    u: &DMatrix<f32>,
    b: &DVector<f32>,
) -> Signal {
    let mut h = DVector::<f32>::zeros(units);
    let mut c = DVector::<f32>::zeros(units);
    let mut outputs = Vec::with_capacity(if return_sequences { steps.len() } else { 0 });

    for x in steps {
        let z = w * x + u * &h + b;
        let i = z.rows(0, units).map(sigmoid);
        let f = z.rows(units, units).map(sigmoid);
        let g = z.rows(2 * units, units).map(f32::tanh);
        let o = z.rows(3 * units, units).map(sigmoid);

        c = f.component_mul(&c) + i.component_mul(&g);
        h = o.component_mul(&c.map(f32::tanh));
        if return_sequences {
            outputs.push(h.clone());
        }
    }

    if return_sequences {
        Signal::Sequence(outputs)
    } else {
        Signal::Vector(h)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn activate(x: DVector<f32>, activation: Activation) -> DVector<f32> {
    match activation {
        Activation::Linear => x,
        Activation::Relu => x.map(|v| v.max(0.0)),
        Activation::Softmax => {
            let max = x.max();
            let exp = x.map(|v| (v - max).exp());
            let sum = exp.sum();
            exp / sum
        }
    }
}

/// Keras `kernel[input][unit]` into a (units, inputs) matrix.
fn keras_kernel(kernel: &[Vec<f32>], inputs: usize, units: usize) -> Result<DMatrix<f32>, String> {
    if kernel.len() != inputs {
        return Err(format!("expected {} rows, found {}", inputs, kernel.len()));
    }
    if let Some(row) = kernel.iter().find(|r| r.len() != units) {
        return Err(format!("expected {} columns, found {}", units, row.len()));
    }
    Ok(DMatrix::from_fn(units, inputs, |r, c| kernel[c][r]))
}

fn vector(values: Vec<f32>, len: usize) -> Result<DVector<f32>, String> {
    if values.len() != len {
        return Err(format!("expected {} values, found {}", len, values.len()));
    }
    Ok(DVector::from_vec(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FrameFeatureVector;

    fn sequence(frames: usize, width: usize, value: f32) -> PoseSequence {
        PoseSequence::from_frames(
            (0..frames)
                .map(|_| FrameFeatureVector::from_vec(vec![value; width]))
                .collect(),
        )
    }

    fn lstm(inputs: usize, units: usize, return_sequences: bool, weight: f32) -> LayerSpec {
        LayerSpec::Lstm {
            units,
            return_sequences,
            kernel: vec![vec![weight; 4 * units]; inputs],
            recurrent_kernel: vec![vec![0.0; 4 * units]; units],
            bias: vec![0.0; 4 * units],
        }
    }

    fn dense(inputs: usize, units: usize, activation: Activation) -> LayerSpec {
        LayerSpec::Dense {
            activation,
            kernel: vec![vec![0.0; units]; inputs],
            bias: vec![0.0; units],
        }
    }

    #[test]
    fn zero_weights_give_uniform_softmax() {
        let net = LstmNetwork::from_layers(
            (4, 3),
            vec![
                lstm(3, 2, true, 0.1),
                lstm(2, 2, false, 0.1),
                dense(2, 5, Activation::Softmax),
            ],
        )
        .unwrap();
        assert_eq!(net.num_classes(), 5);

        let probs = net.predict(&sequence(4, 3, 1.0)).unwrap();
        assert_eq!(probs.len(), 5);
        for p in probs {
            assert!((p - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn single_lstm_step_matches_hand_computation() {
        // one unit, one input, kernel 1 for every gate, no recurrence on the first step
        let net = LstmNetwork::from_layers(
            (1, 1),
            vec![
                lstm(1, 1, false, 1.0),
                LayerSpec::Dense {
                    activation: Activation::Linear,
                    kernel: vec![vec![1.0]],
                    bias: vec![0.0],
                },
            ],
        )
        .unwrap();
        let out = net.predict(&sequence(1, 1, 0.5)).unwrap();

        let s = 1.0 / (1.0 + (-0.5f32).exp());
        let c = s * 0.5f32.tanh();
        let h = s * c.tanh();
        assert!((out[0] - h).abs() < 1e-6);
    }

    #[test]
    fn batch_norm_folds_into_scale_and_shift() {
        let net = LstmNetwork::from_layers(
            (1, 1),
            vec![
                lstm(1, 1, false, 0.0),
                LayerSpec::BatchNorm {
                    gamma: vec![2.0],
                    beta: vec![1.0],
                    moving_mean: vec![0.5],
                    moving_variance: vec![4.0],
                    epsilon: 0.0,
                },
            ],
        )
        .unwrap();
        // zero kernels: i = f = o = 0.5, g = 0, so h = 0
        let out = net.predict(&sequence(1, 1, 3.0)).unwrap();
        assert!((out[0] - (2.0 * (0.0 - 0.5) / 2.0 + 1.0)).abs() < 1e-6);
    }

    #[test]
    fn dimension_errors_are_caught_at_load() {
        assert!(LstmNetwork::from_layers((30, 288), vec![lstm(287, 4, false, 0.0)]).is_err());
        assert!(LstmNetwork::from_layers((30, 288), vec![lstm(288, 4, true, 0.0)]).is_err());
        assert!(LstmNetwork::from_layers(
            (30, 288),
            vec![lstm(288, 4, false, 0.0), lstm(4, 4, false, 0.0)]
        )
        .is_err());
    }

    #[test]
    fn wrong_input_shape_is_rejected() {
        let net = LstmNetwork::from_layers((2, 3), vec![lstm(3, 2, false, 0.0)]).unwrap();
        assert!(net.predict(&sequence(3, 3, 0.0)).is_err());
    }

    #[test]
    fn weights_file_parses() {
        let json = r#"{
            "input_shape": [2, 1],
            "layers": [
                {"type": "lstm", "units": 1, "kernel": [[0,0,0,0]],
                 "recurrent_kernel": [[0,0,0,0]], "bias": [0,0,0,0]},
                {"type": "dense", "activation": "softmax", "kernel": [[0, 0]], "bias": [0, 0]}
            ]
        }"#;
        let spec: ModelFile = serde_json::from_str(json).unwrap();
        let net = LstmNetwork::from_file(spec).unwrap();
        assert_eq!(net.input_shape(), (2, 1));
        assert_eq!(net.predict(&sequence(2, 1, 1.0)).unwrap(), vec![0.5, 0.5]);
    }
}
