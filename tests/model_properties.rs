//! Whole-model behavior: causality, cache equivalence, weight tying and
//! gradients.

use arcane::{
    ArcaneError, KvCache, LanguageModel, ModelConfig, Parameters, RotaryForm, Tensor,
};

fn config() -> ModelConfig {
    ModelConfig {
        block_size: 12,
        vocab_size: 20,
        n_embd: 16,
        n_head: 2,
        n_layer: 2,
        dropout: 0.0,
        ..ModelConfig::tiny(20)
    }
}

fn eval_model(config: &ModelConfig, seed: u64) -> LanguageModel {
    let mut model = LanguageModel::new(config, seed).unwrap();
    model.set_training(false);
    model
}

/// Logits for one batch row and position.
fn row(logits: &Tensor, b: usize, t: usize) -> &[f32] {
    let (seq, vocab) = (logits.shape[1], logits.shape[2]);
    let start = (b * seq + t) * vocab;
    &logits.data[start..start + vocab]
}

fn assert_rows_close(a: &[f32], b: &[f32], eps: f32) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() <= eps);
    }
}

#[test]
fn construction_requires_divisible_heads() {
    let bad = ModelConfig {
        n_embd: 18,
        n_head: 4,
        ..config()
    };
    assert!(matches!(
        LanguageModel::new(&bad, 0),
        Err(ArcaneError::InvalidConfig(_))
    ));
}

#[test]
fn logits_do_not_see_the_future() {
    let model = eval_model(&config(), 1);
    let a = vec![vec![3, 1, 4, 1, 5, 9, 2, 6]];
    let mut b = a.clone();
    b[0][5] = 0;
    b[0][7] = 19;

    let la = model.forward(&a, None).unwrap().logits;
    let lb = model.forward(&b, None).unwrap().logits;
    for t in 0..5 {
        assert_eq!(row(&la, 0, t), row(&lb, 0, t), "position {t}");
    }
    assert_ne!(row(&la, 0, 5), row(&lb, 0, 5));
}

#[test]
fn cached_decoding_matches_full_forward() {
    for form in [RotaryForm::Literal, RotaryForm::Standard] {
        let config = ModelConfig {
            rotary_form: form,
            ..config()
        };
        let model = eval_model(&config, 2);
        let tokens = vec![7, 2, 11, 5, 5, 18, 0, 3, 9, 14];

        let full = model.forward(&[tokens.clone()], None).unwrap().logits;

        let mut kv = KvCache::new(config.n_layer);
        let first = model.forward_cached(&[tokens[..4].to_vec()], &mut kv).unwrap();
        for t in 0..4 {
            assert_rows_close(row(&first, 0, t), row(&full, 0, t), 1e-5);
        }
        for (t, &id) in tokens.iter().enumerate().skip(4) {
            let step = model.forward_cached(&[vec![id]], &mut kv).unwrap();
            assert_eq!(step.shape, vec![1, 1, config.vocab_size]);
            assert_rows_close(row(&step, 0, 0), row(&full, 0, t), 1e-5);
        }
        assert_eq!(kv.seq_len(), tokens.len());
    }
}

#[test]
fn cache_without_learned_positions_still_matches() {
    let config = ModelConfig {
        learned_positions: false,
        ..config()
    };
    let model = eval_model(&config, 3);
    let tokens = vec![1, 2, 3, 4, 5, 6];
    let full = model.forward(&[tokens.clone()], None).unwrap().logits;

    let mut kv = KvCache::new(config.n_layer);
    model.forward_cached(&[tokens[..3].to_vec()], &mut kv).unwrap();
    let rest = model.forward_cached(&[tokens[3..].to_vec()], &mut kv).unwrap();
    for t in 0..3 {
        assert_rows_close(row(&rest, 0, t), row(&full, 0, t + 3), 1e-5);
    }
}

#[test]
fn cleared_cache_behaves_like_no_cache() {
    let model = eval_model(&config(), 4);
    let mut kv = KvCache::new(2);
    model.forward_cached(&[vec![9, 9, 9, 9, 9]], &mut kv).unwrap();
    kv.clear();
    assert!(kv.is_empty());

    let idx = vec![vec![4, 8, 15, 16]];
    let cached = model.forward_cached(&idx, &mut kv).unwrap();
    let uncached = model.forward(&idx, None).unwrap().logits;
    for t in 0..4 {
        assert_rows_close(row(&cached, 0, t), row(&uncached, 0, t), 1e-5);
    }
}

#[test]
fn cache_overflow_is_an_error() {
    let model = eval_model(&config(), 5);
    let mut kv = KvCache::new(2);
    model.forward_cached(&[vec![1; 10]], &mut kv).unwrap();
    model.forward_cached(&[vec![1; 2]], &mut kv).unwrap();
    assert!(matches!(
        model.forward_cached(&[vec![1]], &mut kv),
        Err(ArcaneError::SequenceTooLong { len: 13, max: 12 })
    ));
}

#[test]
fn batched_rows_are_independent() {
    let model = eval_model(&config(), 6);
    let a = vec![1, 2, 3, 4];
    let b = vec![19, 18, 17, 16];
    let both = model.forward(&[a.clone(), b.clone()], None).unwrap().logits;
    let only_b = model.forward(&[b], None).unwrap().logits;
    for t in 0..4 {
        assert_rows_close(row(&both, 1, t), row(&only_b, 0, t), 1e-6);
    }
}

#[test]
fn loss_is_absent_without_targets() {
    let model = eval_model(&config(), 7);
    let out = model.forward(&[vec![1, 2, 3]], None).unwrap();
    assert!(out.loss.is_none());
    assert_eq!(out.logits.shape, vec![1, 3, 20]);

    let out = model.forward(&[vec![1, 2, 3]], Some(&[vec![2, 3, 4]])).unwrap();
    let loss = out.loss.unwrap();
    // near-uniform predictions at init
    assert!((loss - 20f32.ln()).abs() <= 0.2);
}

#[test]
fn output_head_is_the_token_embedding() {
    let mut model = LanguageModel::new(&config(), 8).unwrap();
    assert!(std::ptr::eq(model.token_embedding(), model.lm_head()));

    let before = model.token_embedding().clone();
    let idx = vec![vec![1, 2, 3, 4]];
    let (logits, cache) = model.forward_train(&idx).unwrap();
    let (_, grad) = model.loss_and_grad(&logits, &[vec![2, 3, 4, 5]]).unwrap();
    let grads = model.backward(&grad, &cache);
    let mut opt = model.configure_optimizer(0.1, (0.9, 0.95));
    opt.step(&mut model, &grads, 1e-2);

    assert!(std::ptr::eq(model.token_embedding(), model.lm_head()));
    assert_ne!(model.lm_head(), &before);
    // tokens never seen as input still move through the output-head gradient
    let c = model.config.n_embd;
    let unseen = 15;
    assert_ne!(
        &model.lm_head().data[unseen * c..(unseen + 1) * c],
        &before.data[unseen * c..(unseen + 1) * c]
    );
}

#[test]
fn tied_matrix_is_counted_once() {
    let config = config();
    let model = LanguageModel::new(&config, 0).unwrap();
    let names: Vec<String> = model.named_tensors().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names.iter().filter(|n| n.starts_with("wte")).count(), 1);
    let c = config.n_embd;
    let per_block = 2 * (2 * c) + (c * 3 * c + 3 * c) + (c * c + c) + (c * 4 * c + 4 * c) + (4 * c * c + c);
    let expected = config.vocab_size * c + config.block_size * c + config.n_layer * per_block + 2 * c;
    assert_eq!(model.num_parameters(), expected);
}

fn loss_of(model: &LanguageModel, idx: &[Vec<usize>], targets: &[Vec<usize>]) -> f32 {
    model.forward(idx, Some(targets)).unwrap().loss.unwrap()
}

fn nudge(model: &mut LanguageModel, target: &str, index: usize, delta: f32) {
    model.visit_mut("", &mut |name, t| {
        if name == target {
            t.data[index] += delta;
        }
    });
}

#[test]
fn analytic_gradients_match_finite_differences() {
    let config = ModelConfig {
        block_size: 4,
        vocab_size: 7,
        n_embd: 8,
        n_head: 2,
        n_layer: 1,
        ..config()
    };
    let mut model = LanguageModel::new(&config, 11).unwrap();
    // larger weights than the default init so every path carries signal
    for t in model.tensors_mut() {
        if t.ndim() >= 2 {
            t.scale(10.0);
        }
    }
    let idx = vec![vec![1, 5, 2, 6], vec![0, 3, 3, 4]];
    let targets = vec![vec![5, 2, 6, 0], vec![3, 3, 4, 1]];

    let (logits, cache) = model.forward_train(&idx).unwrap();
    let (_, grad) = model.loss_and_grad(&logits, &targets).unwrap();
    let grads = model.backward(&grad, &cache);
    let analytic: Vec<(String, Vec<f32>)> = grads
        .named_tensors()
        .into_iter()
        .map(|(n, t)| (n, t.data.clone()))
        .collect();

    let checks = [
        ("wte.weight", 5 * 8 + 3),
        ("wte.weight", 8),
        ("wpe.weight", 2 * 8 + 1),
        ("blocks.0.ln_1.weight", 4),
        ("blocks.0.attn.qkv.weight", 3 * 24 + 2),
        ("blocks.0.attn.qkv.weight", 6 * 24 + 20),
        ("blocks.0.attn.proj.bias", 7),
        ("blocks.0.mlp.fc.weight", 2 * 32 + 9),
        ("blocks.0.mlp.proj.weight", 10 * 8 + 3),
        ("ln_f.bias", 0),
    ];
    let eps = 1e-2;
    for (name, index) in checks {
        nudge(&mut model, name, index, eps);
        let up = loss_of(&model, &idx, &targets);
        nudge(&mut model, name, index, -2.0 * eps);
        let down = loss_of(&model, &idx, &targets);
        nudge(&mut model, name, index, eps);

        let numeric = (up - down) / (2.0 * eps);
        let exact = analytic
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, g)| g[index])
            .unwrap();
        assert!(
            (numeric - exact).abs() <= 2e-3 + 0.05 * exact.abs(),
            "{name}[{index}]: numeric {numeric}, analytic {exact}"
        );
    }
}
