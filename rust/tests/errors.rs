/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use tinymr::{
    keys, ClosedTaskError, InvalidConfigurationError, KeyArityError, KeyTuple, Phase, Reducer,
    Task, TaskConfig, UnorderableKeyError, Value,
};

fn first_value(key: &Value, values: Vec<Value>) -> Result<KeyTuple> {
    Ok(vec![key.clone(), values.into_iter().next().unwrap_or_default()])
}

fn passthrough(config: TaskConfig) -> Result<Task<KeyTuple>> {
    Task::builder(|record: KeyTuple| Ok(vec![record]), Reducer::single(first_value))
        .config(config)
        .build()
}

#[test]
fn test_map_arity_mismatch() -> Result<()> {
    let mut task = passthrough(TaskConfig::default())?;
    let err = task
        .run(vec![keys!["a", 1], keys!["b", 2, 3]])
        .unwrap_err();
    let err = err
        .downcast_ref::<KeyArityError>()
        .unwrap_or_else(|| panic!("unexpected error: {err:#}"));
    assert_eq!(err.phase, Phase::Map);
    assert_eq!(err.expected, 2);
    assert_eq!(err.got, 3);
    assert_eq!(err.tuple, keys!["b", 2, 3]);
    Ok(())
}

#[test]
fn test_first_tuple_of_unknown_shape() -> Result<()> {
    let mut task = passthrough(TaskConfig {
        n_sort_keys: 1,
        ..Default::default()
    })?;
    let err = task.run(vec![keys!["a"]]).unwrap_err();
    let err = err.downcast_ref::<KeyArityError>().unwrap();
    assert_eq!(err.expected, 3);
    assert_eq!(err.got, 1);

    // without sort keys, only the short shape is accepted
    let mut task = passthrough(TaskConfig::default())?;
    let err = task.run(vec![keys!["a", 1, 2]]).unwrap_err();
    assert_eq!(err.downcast_ref::<KeyArityError>().unwrap().expected, 2);
    Ok(())
}

#[test]
fn test_both_shapes_accepted_as_first_tuple() -> Result<()> {
    let config = TaskConfig {
        n_sort_keys: 1,
        ..Default::default()
    };
    let mut task = passthrough(config.clone())?;
    let output = task.run(vec![keys!["a", 2, "x"], keys!["a", 1, "y"]])?;
    assert_eq!(output.get(&"a".into()).and_then(|v| v.one()), Some(&"y".into()));

    let mut task = passthrough(config)?;
    let output = task.run(vec![keys!["a", "x"], keys!["a", "y"]])?;
    assert_eq!(output.get(&"a".into()).and_then(|v| v.one()), Some(&"x".into()));
    Ok(())
}

#[test]
fn test_map_arity_mismatch_across_workers() -> Result<()> {
    let mut task = passthrough(TaskConfig {
        n_sort_keys: 1,
        jobs: 2,
        chunksize: 1,
        ..Default::default()
    })?;
    // each worker sees a consistent shape, but not the same one
    let err = task
        .run(vec![keys!["a", "x"], keys!["b", 1, "y"]])
        .unwrap_err();
    let err = err.downcast_ref::<KeyArityError>().unwrap();
    assert_eq!(err.phase, Phase::Map);
    assert_eq!((err.expected, err.got), (2, 3));
    Ok(())
}

#[test]
fn test_reduce_arity_mismatch() -> Result<()> {
    for jobs in [1, 2] {
        let mut task = Task::builder(
            |record: KeyTuple| Ok(vec![record]),
            Reducer::single(|key: &Value, _: Vec<Value>| {
                Ok(if key == &Value::from("a") {
                    keys![key, 1]
                } else {
                    keys![key, 1, 2]
                })
            }),
        )
        .config(TaskConfig {
            jobs,
            ..Default::default()
        })
        .build()?;
        let err = task
            .run(vec![keys!["a", 1], keys!["b", 2]])
            .unwrap_err();
        let err = err.downcast_ref::<KeyArityError>().unwrap();
        assert_eq!(err.phase, Phase::Reduce, "jobs={jobs}");
    }
    Ok(())
}

#[test]
fn test_combine_arity_mismatch() -> Result<()> {
    let mut task = Task::builder(|record: KeyTuple| Ok(vec![record]), Reducer::single(first_value))
        .combiner(|key: &Value, _: Vec<Value>| Ok(vec![keys![key, 1], keys![key, 1, 2]]))
        .build()?;
    let err = task.run(vec![keys!["a", 1]]).unwrap_err();
    assert_eq!(
        err.downcast_ref::<KeyArityError>().map(|e| e.phase),
        Some(Phase::Combine)
    );
    Ok(())
}

#[test]
fn test_unorderable_keys() -> Result<()> {
    let records = vec![keys![1, "x"], keys!["1", "y"]];

    let mut task = passthrough(TaskConfig::default())?;
    let err = task.run(records.clone()).unwrap_err();
    assert!(err.downcast_ref::<UnorderableKeyError>().is_some(), "{err:#}");

    // grouping alone does not need keys to be comparable
    let mut task = passthrough(TaskConfig {
        sort: false,
        ..Default::default()
    })?;
    assert_eq!(task.run(records)?.len(), 2);
    Ok(())
}

#[test]
fn test_unorderable_sort_keys() -> Result<()> {
    let mut task = passthrough(TaskConfig {
        n_sort_keys: 1,
        ..Default::default()
    })?;
    let err = task
        .run(vec![keys!["k", 1, "x"], keys!["k", "one", "y"]])
        .unwrap_err();
    assert!(err.downcast_ref::<UnorderableKeyError>().is_some());
    Ok(())
}

#[test]
fn test_closed_task() -> Result<()> {
    let closed = Arc::new(AtomicUsize::new(0));
    let on_close = closed.clone();
    let mut task = Task::builder(|record: KeyTuple| Ok(vec![record]), Reducer::single(first_value))
        .on_close(move || {
            on_close.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .build()?;
    task.run(vec![keys!["a", 1]])?;
    task.close()?;
    assert!(task.is_closed());
    task.close()?;

    let err = task.run(vec![keys!["a", 1]]).unwrap_err();
    assert!(err.downcast_ref::<ClosedTaskError>().is_some());
    drop(task);
    assert_eq!(closed.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn test_scoped_task() -> Result<()> {
    let mut task = passthrough(TaskConfig::default())?;
    let output = task.scoped(|task| task.run(vec![keys!["a", 1]]))?;
    assert_eq!(output.len(), 1);
    assert!(task.is_closed());
    let err = task.run(vec![keys!["a", 1]]).unwrap_err();
    assert!(err.downcast_ref::<ClosedTaskError>().is_some());

    // closed even when the body fails
    let mut task = passthrough(TaskConfig::default())?;
    assert!(task
        .scoped(|task| task.run(vec![keys!["a", 1], keys!["a"]]))
        .is_err());
    assert!(task.is_closed());
    Ok(())
}

#[test]
fn test_dropped_task_is_closed() -> Result<()> {
    let closed = Arc::new(AtomicUsize::new(0));
    let on_close = closed.clone();
    let task = Task::builder(|record: KeyTuple| Ok(vec![record]), Reducer::single(first_value))
        .on_close(move || {
            on_close.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .build()?;
    drop(task);
    assert_eq!(closed.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn test_invalid_configuration() -> Result<()> {
    let cases = [
        (
            TaskConfig {
                jobs: 0,
                ..Default::default()
            },
            InvalidConfigurationError::NonPositive {
                name: "jobs",
                value: 0,
            },
        ),
        (
            TaskConfig {
                reduce_chunksize: Some(0),
                ..Default::default()
            },
            InvalidConfigurationError::NonPositive {
                name: "reduce_chunksize",
                value: 0,
            },
        ),
        (
            TaskConfig {
                threaded: false,
                jobs: 2,
                ..Default::default()
            },
            InvalidConfigurationError::UnsupportedPoolMode { jobs: 2 },
        ),
        (
            TaskConfig {
                n_partition_keys: 0,
                ..Default::default()
            },
            InvalidConfigurationError::NoPartitionKey,
        ),
    ];
    for (config, expected) in cases {
        let err = passthrough(config).err().unwrap();
        assert_eq!(err.downcast_ref::<InvalidConfigurationError>(), Some(&expected));
    }

    // a single job does not need threads
    passthrough(TaskConfig {
        threaded: false,
        ..Default::default()
    })?;
    Ok(())
}

#[test]
fn test_callback_errors_propagate() -> Result<()> {
    let mut task = Task::builder(
        |i: i64| {
            if i == 3 {
                Err(anyhow!("boom at {i}"))
            } else {
                Ok(vec![keys![i, i]])
            }
        },
        Reducer::single(first_value),
    )
    .build()?;
    let err = task.run(0..5).unwrap_err();
    assert_eq!(err.to_string(), "boom at 3");

    // a failed run leaves the task usable
    assert!(!task.is_closed());
    assert_eq!(task.run(0..3)?.len(), 3);
    Ok(())
}
