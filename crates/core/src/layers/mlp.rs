use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Activation, Linear, VarBuilder};

/// Checkpoint names of the gate, up and down projections.
#[derive(Debug, Clone, Copy)]
pub struct MlpNames {
    pub gate: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

impl MlpNames {
    pub const LLAMA: Self = Self {
        gate: "gate_proj",
        up: "up_proj",
        down: "down_proj",
    };
    pub const INTERNLM2: Self = Self {
        gate: "w1",
        up: "w3",
        down: "w2",
    };
}

/// Gated MLP: `down(act(gate(x)) * up(x))`. SwiGLU when `act` is SiLU.
pub struct SwiGluMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: Activation,
}

impl SwiGluMlp {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        names: MlpNames,
        act: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gate_proj = linear_no_bias(hidden_size, intermediate_size, vb.pp(names.gate))?;
        let up_proj = linear_no_bias(hidden_size, intermediate_size, vb.pp(names.up))?;
        let down_proj = linear_no_bias(intermediate_size, hidden_size, vb.pp(names.down))?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            act,
        })
    }
}

impl Module for SwiGluMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self
            .gate_proj
            .forward(xs)?
            .apply(&self.act)?;
        let up = self.up_proj.forward(xs)?;
        (gate * up)?.apply(&self.down_proj)
    }
}
