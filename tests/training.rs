//! End-to-end training behavior.

use arcane::data::{get_batch, train_val_split, TRAIN_FRACTION};
use arcane::gradients::{clip_grad_norm, grad_norm, scale_all};
use arcane::{
    ByteTokenizer, Checkpoint, GenerateOptions, LanguageModel, ModelConfig, TrainConfig, Trainer,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn toy_config() -> ModelConfig {
    ModelConfig {
        block_size: 8,
        vocab_size: 8,
        n_embd: 32,
        n_head: 2,
        n_layer: 1,
        dropout: 0.0,
        ..ModelConfig::tiny(8)
    }
}

/// 0 1 2 ... 7 0 1 2 ... : every next token is determined by the current one.
fn cycle(len: usize) -> Vec<usize> {
    (0..len).map(|i| i % 8).collect()
}

#[test]
fn repeating_sequence_is_learned() {
    let mut model = LanguageModel::new(&toy_config(), 42).unwrap();
    let mut opt = model.configure_optimizer(0.0, (0.9, 0.95));
    let data = cycle(200);
    let mut rng = StdRng::seed_from_u64(0);

    let mut first = None;
    let mut last = f32::INFINITY;
    for _ in 0..300 {
        let batch = get_batch(&data, 8, 4, &mut rng).unwrap();
        let (logits, cache) = model.forward_train(&batch.x).unwrap();
        let (loss, grad) = model.loss_and_grad(&logits, &batch.y).unwrap();
        let mut grads = model.backward(&grad, &cache);
        clip_grad_norm(&mut grads, 1.0);
        opt.step(&mut model, &grads, 1e-2);
        first.get_or_insert(loss);
        last = loss;
    }

    let first = first.unwrap();
    assert!(first > 1.5, "initial loss {first}");
    assert!(last < 0.3, "final loss {last}");
}

#[test]
fn clipping_bounds_model_gradients() {
    let model = LanguageModel::new(&toy_config(), 1).unwrap();
    let idx = vec![vec![0, 1, 2, 3, 4, 5, 6, 7]];
    let (logits, cache) = model.forward_train(&idx).unwrap();
    let (_, grad) = model.loss_and_grad(&logits, &[vec![1, 2, 3, 4, 5, 6, 7, 0]]).unwrap();
    let mut grads = model.backward(&grad, &cache);
    scale_all(&mut grads, 1e6);

    let before = clip_grad_norm(&mut grads, 1.0);
    assert!(before > 1.0);
    assert!(grad_norm(&grads) <= 1.0 + 1e-4);
}

#[test]
fn split_follows_ninety_ten() {
    let tokens = cycle(1000);
    let (train, val) = train_val_split(&tokens, TRAIN_FRACTION);
    assert_eq!((train.len(), val.len()), (900, 100));
}

#[test]
fn trainer_checkpoint_resumes_and_generates() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("toy.ckpt");
    let train_config = TrainConfig {
        batch_size: 4,
        learning_rate: 1e-2,
        max_iters: 40,
        warmup_iters: 5,
        eval_interval: 10,
        eval_iters: 4,
        checkpoint_path: ckpt.clone(),
        log_csv: Some(dir.path().join("log.csv")),
        ..TrainConfig::default()
    };
    let tokens = cycle(400);

    let model = LanguageModel::new(&toy_config(), 3).unwrap();
    let mut trainer = Trainer::new(model, train_config.clone(), &tokens).unwrap();
    let summary = trainer.run().unwrap();
    assert_eq!(summary.iterations, 40);
    assert!(summary.last_train_loss.unwrap() < 2.0);

    let saved = Checkpoint::load(&ckpt).unwrap().unwrap();
    assert_eq!(saved.best_val_loss, summary.best_val_loss);
    let csv = std::fs::read_to_string(dir.path().join("log.csv")).unwrap();
    // evals at 0, 10, 20, 30 and the final iteration 39
    assert_eq!(csv.lines().count(), 1 + 5);

    // a fresh trainer picks up the stored weights and their measured loss
    let fresh = LanguageModel::new(&toy_config(), 99).unwrap();
    let mut resumed = Trainer::new(fresh, train_config, &tokens).unwrap();
    resumed.resume(&saved, &ckpt).unwrap();
    assert_eq!(resumed.iteration(), saved.iter);
    assert!(resumed.best_val_loss() < 2.0);

    // restored weights give identical logits to the saved snapshot
    let restored = saved.to_model(&ckpt).unwrap();
    let idx = vec![vec![0, 1, 2, 3]];
    assert_eq!(
        restored.forward(&idx, None).unwrap().logits,
        resumed.model().forward(&idx, None).unwrap().logits
    );

    let mut restored = restored;
    restored.set_training(false);
    let out = restored
        .generate(
            &ByteTokenizer,
            "\u{1}\u{2}",
            &GenerateOptions {
                max_length: 8,
                top_k: 3,
                ..GenerateOptions::default()
            },
            |_| {},
        )
        .unwrap();
    assert!(out[0].len() <= 8);
    assert!(out[0].iter().all(|&id| id < 8));
}
