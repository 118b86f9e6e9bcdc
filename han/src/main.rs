use std::{env, io};

use han::{
    Result,
    arch::{
        Han, Parameterized,
        loss::{CrossEntropy, LossFn, one_hot},
    },
    config::{HanConfig, OptimizerConfig},
    optimization::ParamGroups,
};
use hetgraph::{HeteroGraph, Metapath};
use log::info;
use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};

const PAPERS: usize = 60;
const AUTHORS: usize = 20;
const SUBJECTS: usize = 3;
const EPOCHS: usize = 20;

/// Papers written by authors and filed under subjects, the subject being the label.
fn synthetic_graph(rng: &mut StdRng) -> Result<(HeteroGraph, Vec<usize>)> {
    let labels: Vec<usize> = (0..PAPERS).map(|p| p % SUBJECTS).collect();

    // Authors mostly write about one subject.
    let mut pa = Vec::new();
    for (p, &label) in labels.iter().enumerate() {
        let author = if rng.random::<f32>() < 0.9 {
            label + SUBJECTS * rng.random_range(0..AUTHORS / SUBJECTS)
        } else {
            rng.random_range(0..AUTHORS)
        };
        pa.push((p, author));
    }
    let ps: Vec<_> = labels.iter().copied().enumerate().collect();

    let g = HeteroGraph::builder()
        .add_nodes("paper", PAPERS)
        .add_nodes("author", AUTHORS)
        .add_nodes("subject", SUBJECTS)
        .add_edges("paper", "pa", "author", pa.iter().copied())?
        .add_edges("author", "ap", "paper", pa.iter().map(|&(p, a)| (a, p)))?
        .add_edges("paper", "ps", "subject", ps.iter().copied())?
        .add_edges("subject", "sp", "paper", ps.iter().map(|&(p, s)| (s, p)))?
        .build();

    Ok((g, labels))
}

fn load_config() -> Result<HanConfig> {
    match env::var("HAN_CONFIG") {
        Ok(path) => {
            info!("loading config from {path}");
            HanConfig::from_path(path)
        }
        Err(_) => {
            let mut config = HanConfig::new(8, 8, SUBJECTS, vec![2]);
            config.threshold = 0.3;
            config.dropout = 0.1;
            config.seed = Some(42);
            Ok(config)
        }
    }
}

fn main() -> io::Result<()> {
    env_logger::init();
    Ok(run()?)
}

fn run() -> Result<()> {
    let config = load_config()?;
    let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or_default());
    let (g, labels) = synthetic_graph(&mut rng)?;

    let h = Array2::from_shape_fn((PAPERS, config.in_size), |(p, j)| {
        let signal = if j % SUBJECTS == labels[p] { 1.0 } else { 0.0 };
        signal + rng.random_range(-0.5..0.5)
    });
    let y = one_hot(&labels, config.out_size)?;
    let b_ids: Vec<usize> = (0..PAPERS).collect();

    let mut metapaths = vec![Metapath::new(["pa", "ap"])?, Metapath::new(["ps", "sp"])?];
    let mut model = Han::new(config)?;
    let mut groups = ParamGroups::new(OptimizerConfig::adam(0.01), &model)?;
    let loss_fn = CrossEntropy::new();

    for epoch in 0..EPOCHS {
        model.train();
        model.zero_grad();

        let logits =
            model.forward(&g, h.view(), &mut metapaths, &mut groups, &b_ids, None)?;
        let loss = loss_fn.loss(logits.view(), y.view());
        model.backward(loss_fn.loss_prime(logits.view(), y.view()).view())?;
        groups.step(&mut model)?;

        info!(epoch = epoch, loss = loss, metapaths = metapaths.len(); "finished epoch");
    }

    model.eval();
    let logits = model.forward(&g, h.view(), &mut metapaths, &mut groups, &b_ids, None)?;
    let correct = logits
        .rows()
        .into_iter()
        .zip(&labels)
        .filter(|(row, label)| {
            let predicted = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i);
            predicted == Some(**label)
        })
        .count();

    for layer in model.layers() {
        for (metapath, weight) in layer.semantic_weights() {
            info!(metapath:% = metapath, weight = weight; "semantic attention");
        }
        for (metapath, density) in layer.dense_metapaths() {
            info!(metapath:% = metapath, density = *density; "pruned metapath");
        }
    }

    info!("accuracy: {correct}/{PAPERS}");

    Ok(())
}
