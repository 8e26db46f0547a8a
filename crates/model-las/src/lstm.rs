//! LSTM-ячейки для listener'а и speller'а.
//!
//! Формулы (порядок гейтов i, f, g, o):
//! gates = x @ W_ih^T + b_ih + h @ W_hh^T + b_hh
//! c = sigmoid(f) * c_prev + sigmoid(i) * tanh(g)
//! h = sigmoid(o) * tanh(c)
//!
//! Весовые ключи ячейки:
//! - weight_ih: [4*hidden, input]
//! - weight_hh: [4*hidden, hidden]
//! - bias_ih: [4*hidden]
//! - bias_hh: [4*hidden]
//!
//! Двунаправленный слой хранит ячейки под префиксами `forward` и `backward`.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Состояние одной LSTM-ячейки для батча.
#[derive(Debug, Clone)]
pub struct LstmState {
    /// Выход (memory), `[batch, hidden]`.
    pub h: Tensor,
    /// Ячейка (carry), `[batch, hidden]`.
    pub c: Tensor,
}

impl LstmState {
    /// Нулевое начальное состояние.
    pub fn zeros(batch: usize, hidden_size: usize, dtype: DType, device: &Device) -> Result<Self> {
        let h = Tensor::zeros((batch, hidden_size), dtype, device)?;
        Ok(Self { c: h.clone(), h })
    }

    /// Взять `self` там, где `mask` = 1, и `prev` там, где `mask` = 0.
    ///
    /// `mask`: `[batch, 1]`, u8. На паддинге состояние не меняется.
    fn select(&self, prev: &LstmState, mask: &Tensor) -> Result<Self> {
        let mask = mask.broadcast_as(self.h.shape())?;
        Ok(Self {
            h: mask.where_cond(&self.h, &prev.h)?,
            c: mask.where_cond(&self.c, &prev.c)?,
        })
    }
}

/// Одна LSTM-ячейка (один слой, одно направление).
#[derive(Debug, Clone)]
pub struct LstmCell {
    weight_ih: Tensor, // [4*hidden, input_size]
    weight_hh: Tensor, // [4*hidden, hidden_size]
    bias_ih: Tensor,   // [4*hidden]
    bias_hh: Tensor,   // [4*hidden]
    hidden_size: usize,
}

impl LstmCell {
    /// Загрузить или инициализировать веса ячейки.
    ///
    /// Для `VarMap` веса инициализируются равномерно в `±1/sqrt(hidden)`;
    /// при загрузке из safetensors подсказка игнорируется.
    pub fn load(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let gate_size = 4 * hidden_size;
        let bound = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight_ih = vb.get_with_hints((gate_size, input_size), "weight_ih", init)?;
        let weight_hh = vb.get_with_hints((gate_size, hidden_size), "weight_hh", init)?;
        let bias_ih = vb.get_with_hints(gate_size, "bias_ih", init)?;
        let bias_hh = vb.get_with_hints(gate_size, "bias_hh", init)?;
        Ok(Self {
            weight_ih,
            weight_hh,
            bias_ih,
            bias_hh,
            hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Нулевое состояние для батча.
    pub fn zero_state(&self, batch: usize, device: &Device) -> Result<LstmState> {
        LstmState::zeros(batch, self.hidden_size, self.weight_hh.dtype(), device)
    }

    /// Входная проекция `x @ W_ih^T + b_ih` для любой формы `[..., input]`.
    ///
    /// Для последовательностей считается один раз на весь тензор, а не на каждом шаге.
    pub fn project_input(&self, x: &Tensor) -> Result<Tensor> {
        x.broadcast_matmul(&self.weight_ih.t()?)?
            .broadcast_add(&self.bias_ih)
    }

    /// Шаг по сырому входу `x`: `[batch, input]`.
    pub fn step(&self, x: &Tensor, state: &LstmState) -> Result<LstmState> {
        let x_proj = self.project_input(x)?;
        self.step_projected(&x_proj, state)
    }

    /// Шаг по уже спроецированному входу `x_proj`: `[batch, 4*hidden]`.
    pub fn step_projected(&self, x_proj: &Tensor, state: &LstmState) -> Result<LstmState> {
        let gates = x_proj
            .add(&state.h.matmul(&self.weight_hh.t()?)?)?
            .broadcast_add(&self.bias_hh)?;

        let hs = self.hidden_size;

        // Разбиваем на 4 части: input, forget, cell, output gates
        let i_gate = gates.narrow(D::Minus1, 0, hs)?;
        let f_gate = gates.narrow(D::Minus1, hs, hs)?;
        let g_gate = gates.narrow(D::Minus1, 2 * hs, hs)?;
        let o_gate = gates.narrow(D::Minus1, 3 * hs, hs)?;

        let i_gate = candle_nn::Activation::Sigmoid.forward(&i_gate)?;
        let f_gate = candle_nn::Activation::Sigmoid.forward(&f_gate)?;
        let g_gate = g_gate.tanh()?;
        let o_gate = candle_nn::Activation::Sigmoid.forward(&o_gate)?;

        // c_new = f * c + i * g
        let c = ((f_gate * &state.c)? + (i_gate * g_gate)?)?;
        // h_new = o * tanh(c_new)
        let h = (o_gate * c.tanh()?)?;

        Ok(LstmState { h, c })
    }
}

/// Двунаправленный LSTM-слой с учётом маски.
///
/// На замаскированных шагах состояние переносится без изменений, а выход
/// обнуляется. Обратное направление поэтому стартует с последнего валидного
/// фрейма, как если бы паддинга не было.
#[derive(Debug, Clone)]
pub struct BiLstm {
    forward: LstmCell,
    backward: LstmCell,
}

impl BiLstm {
    pub fn load(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            forward: LstmCell::load(input_size, hidden_size, vb.pp("forward"))?,
            backward: LstmCell::load(input_size, hidden_size, vb.pp("backward"))?,
        })
    }

    /// Размер выхода на шаг: `2 * hidden`.
    pub fn output_dim(&self) -> usize {
        2 * self.forward.hidden_size()
    }

    /// `x`: `[batch, time, input]`, `mask`: `[batch, time]` (u8) → `[batch, time, 2*hidden]`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let fwd = run_direction(&self.forward, x, mask, false)?;
        let bwd = run_direction(&self.backward, x, mask, true)?;
        Tensor::cat(&[&fwd, &bwd], D::Minus1)
    }
}

/// Прогнать одно направление по времени. Выход выровнен по исходным позициям.
fn run_direction(cell: &LstmCell, x: &Tensor, mask: &Tensor, reverse: bool) -> Result<Tensor> {
    let (batch, time, _) = x.dims3()?;
    let x_proj = cell.project_input(x)?; // [batch, time, 4*hidden]
    let mut state = cell.zero_state(batch, x.device())?;
    let zeros = state.h.clone();

    let steps: Vec<usize> = if reverse {
        (0..time).rev().collect()
    } else {
        (0..time).collect()
    };

    let mut outputs = Vec::with_capacity(time);
    for t in steps {
        let x_t = x_proj.i((.., t, ..))?.contiguous()?;
        let m_t = mask.i((.., t..t + 1))?;
        let next = cell.step_projected(&x_t, &state)?;
        state = next.select(&state, &m_t)?;

        let m_out = m_t.broadcast_as(state.h.shape())?;
        outputs.push(m_out.where_cond(&state.h, &zeros)?);
    }
    if reverse {
        outputs.reverse();
    }
    Tensor::stack(&outputs, 1)
}
