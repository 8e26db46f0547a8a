//! Speller: функция перехода декодера с вниманием.
//!
//! Один шаг:
//! 1. (опционально) смешивание входа с сэмплом из предыдущего предсказания
//! 2. `[s_prev, y, c_prev]` → LSTM 1 → LSTM 2 → новое `s`
//! 3. запрос `q = query(s)`, внимание по ключам listener'а → контекст `c`
//! 4. `logits = char_dist([s, c])`
//!
//! Весовые ключи:
//! - `lstm.{0,1}.*` — ячейки
//! - `query.{hidden,out}.*` — MLP запроса (2*att → att)
//! - `char_dist.{hidden,out}.*` — MLP символов (4*V → V)

use candle_core::{bail, DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, RngCore};

use asr_core::{StepControl, StepOutput, TransitionCell};

use crate::attention::{attend, AttentionMemory, Mlp};
use crate::config::LasConfig;
use crate::lstm::{LstmCell, LstmState};

/// Состояние speller'а между шагами.
#[derive(Debug, Clone)]
pub struct SpellerState {
    /// (memory, carry) обеих LSTM-ячеек.
    pub lstm: [LstmState; 2],
    /// Выход второй ячейки, `[batch, decoder_hidden]`.
    pub s: Tensor,
    /// Контекст внимания, `[batch, 2*listener_hidden]`.
    pub context: Tensor,
    /// Логиты предыдущего шага, `[batch, vocab]`.
    pub logits: Tensor,
}

/// Декодер LAS как [`TransitionCell`].
#[derive(Debug, Clone)]
pub struct Speller {
    lstm: [LstmCell; 2],
    query: Mlp,
    char_dist: Mlp,
    decoder_hidden: usize,
    vocab_size: usize,
    prev_prediction_fraction: f64,
}

impl Speller {
    pub fn load(config: &LasConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.decoder_hidden;
        let att = config.attention_dim;
        let vocab = config.vocab_size;

        let lstm = [
            LstmCell::load(config.speller_input_dim(), hidden, vb.pp("lstm.0"))?,
            LstmCell::load(hidden, hidden, vb.pp("lstm.1"))?,
        ];
        let query = Mlp::load(hidden, 2 * att, att, vb.pp("query"))?;
        let char_dist = Mlp::load(
            hidden + config.listener_dim(),
            4 * vocab,
            vocab,
            vb.pp("char_dist"),
        )?;

        Ok(Self {
            lstm,
            query,
            char_dist,
            decoder_hidden: hidden,
            vocab_size: vocab,
            prev_prediction_fraction: config.prev_prediction_fraction,
        })
    }

    /// Scheduled sampling: для каждого примера с вероятностью `p` заменить
    /// ground-truth вход one-hot сэмплом из `softmax(prev_logits)`.
    ///
    /// Случайные числа тянутся в порядке примеров: сначала `u`, затем (если
    /// нужно) индекс символа.
    fn mix_input(&self, input: &Tensor, prev_logits: &Tensor, rng: &mut dyn RngCore) -> Result<Tensor> {
        let (batch, vocab) = input.dims2()?;
        if vocab != self.vocab_size {
            bail!(
                "ширина входа {vocab} не совпадает со словарём speller'а {}",
                self.vocab_size
            );
        }
        if prev_logits.dims() != input.dims() {
            bail!(
                "логиты предыдущего шага {:?} не совпадают со входом {:?}",
                prev_logits.dims(),
                input.dims()
            );
        }
        let probs: Vec<Vec<f32>> = candle_nn::ops::softmax_last_dim(&prev_logits.to_dtype(DType::F32)?)?
            .to_vec2()?;

        let mut sampled: Vec<Option<usize>> = Vec::with_capacity(batch);
        for row in &probs {
            let u: f64 = rng.gen();
            if u < self.prev_prediction_fraction {
                let dist = WeightedIndex::new(row).map_err(candle_core::Error::wrap)?;
                sampled.push(Some(dist.sample(rng)));
            } else {
                sampled.push(None);
            }
        }
        if sampled.iter().all(Option::is_none) {
            return Ok(input.clone());
        }

        let mut mixed: Vec<f32> = input.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        for (b, choice) in sampled.into_iter().enumerate() {
            if let Some(k) = choice {
                let row = &mut mixed[b * vocab..(b + 1) * vocab];
                row.fill(0.0);
                row[k] = 1.0;
            }
        }
        Tensor::from_vec(mixed, (batch, vocab), input.device())?.to_dtype(input.dtype())
    }
}

impl TransitionCell for Speller {
    type State = SpellerState;
    type Constants = AttentionMemory;

    fn initial_state(&self, memory: &AttentionMemory) -> Result<SpellerState> {
        let batch = memory.batch_size();
        let dtype = memory.features.dtype();
        let device = memory.features.device();

        let lstm = [
            self.lstm[0].zero_state(batch, device)?,
            self.lstm[1].zero_state(batch, device)?,
        ];
        Ok(SpellerState {
            lstm,
            s: Tensor::zeros((batch, self.decoder_hidden), dtype, device)?,
            context: Tensor::zeros((batch, memory.feature_dim()), dtype, device)?,
            logits: Tensor::zeros((batch, self.vocab_size), dtype, device)?,
        })
    }

    fn step(
        &self,
        input: &Tensor,
        state: &SpellerState,
        memory: &AttentionMemory,
        control: &mut StepControl<'_>,
    ) -> Result<StepOutput<SpellerState>> {
        let y = match control.blend.as_deref_mut() {
            Some(rng) => self.mix_input(input, &state.logits, rng)?,
            None => input.clone(),
        };

        let rnn_input = Tensor::cat(&[&state.s, &y, &state.context], D::Minus1)?;
        let first = self.lstm[0].step(&rnn_input, &state.lstm[0])?;
        let second = self.lstm[1].step(&first.h, &state.lstm[1])?;
        let s = second.h.clone();

        let query = self.query.forward(&s)?;
        let (context, weights) = attend(&query, memory)?;

        let logits = self
            .char_dist
            .forward(&Tensor::cat(&[&s, &context], D::Minus1)?)?;

        Ok(StepOutput {
            output: logits.clone(),
            state: SpellerState {
                lstm: [first, second],
                s,
                context,
                logits,
            },
            diagnostics: control.capture.then_some(weights),
        })
    }
}
