/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use tinymr::pipeline::TaskBuilder;
use tinymr::{keys, KeyTuple, Output, Reducer, Task, TaskConfig, Value, Values};

fn split_words(line: &str) -> Result<Vec<KeyTuple>> {
    Ok(line.split_whitespace().map(|word| keys![word, 1]).collect())
}

fn sum_counts(word: &Value, counts: Vec<Value>) -> Result<KeyTuple> {
    Ok(keys![word, counts.iter().filter_map(Value::as_int).sum::<i64>()])
}

fn wordcount(config: TaskConfig) -> Result<Task<&'static str>> {
    Task::builder(split_words, Reducer::single(sum_counts))
        .config(config)
        .build()
}

fn counts(output: Output) -> HashMap<String, i64> {
    output
        .into_iter()
        .map(|(word, count)| {
            (
                word.as_str().unwrap().to_owned(),
                count.one().and_then(Value::as_int).unwrap(),
            )
        })
        .collect()
}

const LINES: [&str; 3] = [
    "word something else",
    "else something word",
    "mr python could be cool 1",
];

fn expected_wordcount() -> HashMap<String, i64> {
    [
        ("word", 2),
        ("something", 2),
        ("else", 2),
        ("mr", 1),
        ("python", 1),
        ("could", 1),
        ("be", 1),
        ("cool", 1),
        ("1", 1),
    ]
    .into_iter()
    .map(|(word, count)| (word.to_owned(), count))
    .collect()
}

#[test]
fn test_wordcount() -> Result<()> {
    let mut task = wordcount(TaskConfig::default())?;
    assert_eq!(counts(task.run(LINES)?), expected_wordcount());
    Ok(())
}

#[test]
fn test_wordcount_parallel() -> Result<()> {
    for (jobs, chunksize) in [(2, 1), (4, 1), (4, 2), (3, 10)] {
        let mut task = wordcount(TaskConfig {
            jobs,
            chunksize,
            ..Default::default()
        })?;
        assert_eq!(
            counts(task.run(LINES)?),
            expected_wordcount(),
            "jobs={jobs} chunksize={chunksize}"
        );
    }
    Ok(())
}

#[test]
fn test_task_is_reusable() -> Result<()> {
    let mut task = wordcount(TaskConfig::default())?;
    let first = counts(task.run(LINES)?);
    let second = counts(task.run(LINES)?);
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_output_is_sorted_by_key() -> Result<()> {
    let mut task = wordcount(TaskConfig::default())?;
    let output = task.run(LINES)?;
    let keys: Vec<&Value> = output.keys().collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert_eq!(output.keys().next(), Some(&Value::from("1")));
    Ok(())
}

/// Reducer returning every value, tagged with its (composite) partition key
fn identity_reducer() -> Reducer {
    Reducer::many(|key: &Value, values: Vec<Value>| {
        let prefix = match key {
            Value::Tuple(parts) => parts.clone(),
            key => vec![key.clone()],
        };
        Ok(values
            .into_iter()
            .map(|value| {
                let mut tuple = prefix.clone();
                tuple.push(value);
                tuple
            })
            .collect::<Vec<_>>())
    })
}

fn composite_records() -> Vec<KeyTuple> {
    let mut records = Vec::new();
    for s1 in 0..4 {
        for s2 in 0..4 {
            records.push(keys!["p1", "p2", s1, s2, format!("{s1}-{s2}")]);
            records.push(keys!["p1", "p3", s1, s2, format!("other-{s1}-{s2}")]);
        }
    }
    records
}

fn composite_task(jobs: usize) -> Result<Task<KeyTuple>> {
    Task::builder(|record: KeyTuple| Ok(vec![record]), identity_reducer())
        .config(TaskConfig {
            n_partition_keys: 2,
            n_sort_keys: 2,
            jobs,
            chunksize: 3,
            ..Default::default()
        })
        .build()
}

#[test]
fn test_composite_partition_and_sort_keys() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let expected: Vec<Value> = (0..4)
        .flat_map(|s1| (0..4).map(move |s2| Value::from(format!("{s1}-{s2}"))))
        .collect();

    for jobs in [1, 4] {
        for _ in 0..5 {
            let mut records = composite_records();
            records.shuffle(&mut rng);
            let mut task = composite_task(jobs)?;
            let output = task.run(records)?;
            assert_eq!(output.len(), 2);
            let values = output
                .get(&Value::from(("p1", "p2")))
                .and_then(Values::many)
                .unwrap();
            assert_eq!(values, expected.as_slice(), "jobs={jobs}");
        }
    }
    Ok(())
}

#[test]
fn test_sort_stable_under_parallel_map() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let records: Vec<KeyTuple> = (0..500)
        .map(|i| {
            let sort = rng.gen_range(0..10);
            keys![rng.gen_range(0..5), sort, (sort, i)]
        })
        .collect();

    let run = |jobs: usize| -> Result<Output> {
        Task::builder(|record: KeyTuple| Ok(vec![record]), identity_reducer())
            .config(TaskConfig {
                n_sort_keys: 1,
                jobs,
                chunksize: 7,
                ..Default::default()
            })
            .build()?
            .run(records.clone())
    };
    let serial = run(1)?;
    let parallel = run(4)?;
    assert_eq!(serial, parallel);

    // ties on the sort key keep their arrival order
    for (key, values) in serial.iter() {
        let values = values.many().unwrap();
        for pair in values.windows(2) {
            let (a, b) = (pair[0].as_tuple().unwrap(), pair[1].as_tuple().unwrap());
            ensure!(
                (&a[0], &a[1]) < (&b[0], &b[1]),
                "{key}: {} came before {}",
                pair[0],
                pair[1]
            );
        }
    }
    Ok(())
}

#[test]
fn test_grouping_sees_every_value_once() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(1);
    let items: Vec<(i64, i64)> = (0..1000).map(|i| (rng.gen_range(0..20), i)).collect();
    let mut expected: HashMap<i64, Vec<i64>> = HashMap::new();
    for (key, value) in &items {
        expected.entry(*key).or_default().push(*value);
    }

    for (jobs, chunksize) in [(1, 1), (4, 1), (4, 64)] {
        let mut task = Task::builder(
            |(key, value): (i64, i64)| Ok(vec![keys![key, value]]),
            identity_reducer(),
        )
        .config(TaskConfig {
            jobs,
            chunksize,
            sort: false,
            ..Default::default()
        })
        .build()?;
        let output = task.run(items.clone())?;
        assert_eq!(output.len(), expected.len());
        for (key, values) in output {
            let mut got: Vec<i64> = values
                .into_vec()
                .iter()
                .map(|v| v.as_int().unwrap())
                .collect();
            got.sort();
            let mut want = expected[&key.as_int().unwrap()].clone();
            want.sort();
            assert_eq!(got, want, "jobs={jobs} chunksize={chunksize} key={key}");
        }
    }
    Ok(())
}

#[test]
fn test_mapper_emitting_nothing() -> Result<()> {
    let mut task = Task::builder(
        |_: i64| Ok(Vec::<KeyTuple>::new()),
        Reducer::single(sum_counts),
    )
    .build()?;
    assert!(task.run(0..10)?.is_empty());
    assert!(task.run(Vec::<i64>::new())?.is_empty());
    Ok(())
}

#[test]
fn test_combiner() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let combiner_calls = calls.clone();
    let mut task = Task::builder(split_words, Reducer::single(sum_counts))
        .combiner(move |word: &Value, counts: Vec<Value>| {
            combiner_calls.fetch_add(1, Ordering::Relaxed);
            Ok(vec![sum_counts(word, counts)?])
        })
        .config(TaskConfig {
            jobs: 2,
            chunksize: 1,
            ..Default::default()
        })
        .build()?;
    assert_eq!(counts(task.run(LINES)?), expected_wordcount());
    // one call per distinct word of each line
    assert_eq!(calls.load(Ordering::Relaxed), 3 + 3 + 6);
    Ok(())
}

#[test]
fn test_combiner_producing_nothing() -> Result<()> {
    let mut task = Task::builder(split_words, Reducer::single(sum_counts))
        .combiner(|_: &Value, _: Vec<Value>| Ok(Vec::<KeyTuple>::new()))
        .build()?;
    assert!(task.run(LINES)?.is_empty());
    Ok(())
}

#[test]
fn test_chained_reducers() -> Result<()> {
    // first step regroups words by their count, second lists them
    let mut task = Task::builder(
        split_words,
        Reducer::single(|word: &Value, counts: Vec<Value>| {
            let count: i64 = counts.iter().filter_map(Value::as_int).sum();
            Ok(keys![count, word])
        }),
    )
    .chain_reducer(identity_reducer())
    .config(TaskConfig {
        sort_reduce_with_value: true,
        ..Default::default()
    })
    .build()?;

    let output = task.run(LINES)?;
    assert_eq!(
        output.get(&Value::from(2)).and_then(Values::many),
        Some(keys!["else", "something", "word"].as_slice())
    );
    assert_eq!(
        output.get(&Value::from(1)).and_then(Values::many),
        Some(keys!["1", "be", "cool", "could", "mr", "python"].as_slice())
    );
    Ok(())
}

#[test]
fn test_sort_with_value_and_reverse() -> Result<()> {
    let records = vec![keys!["k", 3], keys!["k", 1], keys!["k", 2]];

    let run = |config: TaskConfig| -> Result<Vec<Value>> {
        let output = Task::builder(|record: KeyTuple| Ok(vec![record]), identity_reducer())
            .config(config)
            .build()?
            .run(records.clone())?;
        Ok(output.into_map().remove(&Value::from("k")).unwrap().into_vec())
    };

    // no sort key and no tie-breaking on values: arrival order
    assert_eq!(run(TaskConfig::default())?, keys![3, 1, 2]);
    assert_eq!(
        run(TaskConfig {
            sort_map_with_value: true,
            ..Default::default()
        })?,
        keys![1, 2, 3]
    );
    assert_eq!(
        run(TaskConfig {
            sort_map_with_value: true,
            sort_map_reverse: true,
            ..Default::default()
        })?,
        keys![3, 2, 1]
    );
    Ok(())
}

#[test]
fn test_sort_key_with_value_tie_break() -> Result<()> {
    let records = vec![
        keys!["k", 2, "b"],
        keys!["k", 1, "z"],
        keys!["k", 2, "a"],
        keys!["k", 1, "y"],
    ];
    let run = |with_value: bool, reverse: bool| -> Result<Vec<Value>> {
        let output = Task::builder(|record: KeyTuple| Ok(vec![record]), identity_reducer())
            .config(TaskConfig {
                n_sort_keys: 1,
                sort_map_with_value: with_value,
                sort_map_reverse: reverse,
                ..Default::default()
            })
            .build()?
            .run(records.clone())?;
        Ok(output.into_map().remove(&Value::from("k")).unwrap().into_vec())
    };
    assert_eq!(run(false, false)?, keys!["z", "y", "b", "a"]);
    assert_eq!(run(true, false)?, keys!["y", "z", "a", "b"]);
    assert_eq!(run(false, true)?, keys!["b", "a", "z", "y"]);
    assert_eq!(run(true, true)?, keys!["b", "a", "z", "y"]);
    Ok(())
}

#[test]
fn test_large_partitions_sorted_on_disk() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(3);
    let records: Vec<KeyTuple> = (0..300)
        .map(|i| keys![i % 2, rng.gen_range(0..1000), i])
        .collect();
    let run = |external_sort_chunksize: Option<usize>| -> Result<Output> {
        Task::builder(|record: KeyTuple| Ok(vec![record]), identity_reducer())
            .config(TaskConfig {
                n_sort_keys: 1,
                external_sort_chunksize,
                ..Default::default()
            })
            .build()?
            .run(records.clone())
    };
    assert_eq!(run(Some(16))?, run(None)?);
    Ok(())
}

#[test]
fn test_output_hook() -> Result<()> {
    let builder: TaskBuilder<&'static str, HashMap<String, i64>> =
        Task::builder(split_words, Reducer::single(sum_counts)).output(|output| Ok(counts(output)));
    let mut task = builder.build()?;
    assert_eq!(task.run(LINES)?, expected_wordcount());
    Ok(())
}

#[test]
fn test_init_hooks() -> Result<()> {
    let map_calls = Arc::new(AtomicUsize::new(0));
    let reduce_calls = Arc::new(AtomicUsize::new(0));
    let (m, r) = (map_calls.clone(), reduce_calls.clone());
    let mut task = Task::builder(split_words, Reducer::single(sum_counts))
        .init_map(move || {
            m.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .init_reduce(move || {
            r.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .build()?;
    task.run(LINES)?;
    task.run(LINES)?;
    assert_eq!(map_calls.load(Ordering::Relaxed), 2);
    assert_eq!(reduce_calls.load(Ordering::Relaxed), 2);
    Ok(())
}

#[test]
fn test_check_map_keys() -> Result<()> {
    for jobs in [1, 2] {
        let mut task = Task::builder(
            |i: i64| Ok(vec![keys![i, 1]]),
            Reducer::single(sum_counts),
        )
        .check_map_keys(|first| {
            ensure!(first[0].as_str().is_some(), "Keys must be strings, got {}", first[0]);
            Ok(())
        })
        .config(TaskConfig {
            jobs,
            ..Default::default()
        })
        .build()?;
        let err = task.run(0..10).unwrap_err();
        assert!(err.to_string().contains("Keys must be strings"), "{err}");
    }
    Ok(())
}

#[test]
fn test_check_reduce_keys() -> Result<()> {
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_by_check = seen.clone();
    let mut task = Task::builder(split_words, Reducer::single(sum_counts))
        .check_reduce_keys(move |first| {
            ensure!(first.len() == 2);
            seen_by_check.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .build()?;
    task.run(LINES)?;
    assert_eq!(seen.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn test_observer_sees_every_item() -> Result<()> {
    struct Counter(Arc<AtomicUsize>);

    impl tinymr::observer::PipelineObserver for Counter {
        fn phase_started(&mut self, _phase: tinymr::Phase) {}
        fn items_processed(&mut self, phase: tinymr::Phase, count: usize) {
            if phase == tinymr::Phase::Map {
                self.0.fetch_add(count, Ordering::Relaxed);
            }
        }
        fn phase_done(&mut self, _phase: tinymr::Phase) {}
    }

    let mapped = Arc::new(AtomicUsize::new(0));
    let mut task = Task::builder(split_words, Reducer::single(sum_counts))
        .observer(Counter(mapped.clone()))
        .config(TaskConfig {
            jobs: 2,
            ..Default::default()
        })
        .build()?;
    task.run(LINES)?;
    assert_eq!(mapped.load(Ordering::Relaxed), LINES.len());
    Ok(())
}
