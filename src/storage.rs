//! Arrow IPC storage of ensembles.
//!
//! Every trace becomes one record batch with one row per draw. The position
//! is stored as a fixed size list, statistics of the step methods as columns
//! prefixed with `step.{block}.`. Variables, blocks, the seed and the status
//! of every chain are stored as json in the schema metadata.

use std::{
    collections::HashMap,
    io::{Cursor, Read, Write},
    sync::Arc,
};

use arrow::{
    array::{
        Array, ArrayRef, BooleanArray, BooleanBuilder, FixedSizeListArray, FixedSizeListBuilder,
        Float64Array, Float64Builder, RecordBatch, RecordBatchOptions, UInt64Array, UInt64Builder,
    },
    datatypes::{Field, Schema, SchemaRef},
    ipc::{reader::StreamReader, writer::StreamWriter},
};
use serde::{Deserialize, Serialize};

use crate::{
    chain::{ChainStatus, Draw, Trace},
    competence::BlockAssignment,
    error::{Result, SamplerError},
    model::VariableInfo,
    sampler::{ChainFailure, Ensemble},
    step_method::StepStats,
};

const METADATA_KEY: &str = "mcmc_engine.ensemble";

#[derive(Debug, Serialize, Deserialize)]
struct TraceHeader {
    chain: u64,
    status: ChainStatus,
    draws: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct FailureHeader {
    chain: u64,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnsembleHeader {
    variables: Vec<VariableInfo>,
    blocks: Vec<BlockAssignment>,
    seed: u64,
    traces: Vec<TraceHeader>,
    failures: Vec<FailureHeader>,
}

fn dimension(variables: &[VariableInfo]) -> usize {
    variables.iter().map(|var| var.size).sum()
}

/// Builders for the statistics of one step method.
struct StatBuilders {
    accept_prob: Float64Builder,
    accepted: BooleanBuilder,
    diverging: BooleanBuilder,
    tree_depth: UInt64Builder,
    maxdepth_reached: BooleanBuilder,
    energy: Float64Builder,
    energy_error: Float64Builder,
    step_size: Float64Builder,
    n_steps: UInt64Builder,
}

impl StatBuilders {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            accept_prob: Float64Builder::with_capacity(capacity),
            accepted: BooleanBuilder::with_capacity(capacity),
            diverging: BooleanBuilder::with_capacity(capacity),
            tree_depth: UInt64Builder::with_capacity(capacity),
            maxdepth_reached: BooleanBuilder::with_capacity(capacity),
            energy: Float64Builder::with_capacity(capacity),
            energy_error: Float64Builder::with_capacity(capacity),
            step_size: Float64Builder::with_capacity(capacity),
            n_steps: UInt64Builder::with_capacity(capacity),
        }
    }

    fn append(&mut self, stats: &StepStats) {
        self.accept_prob.append_value(stats.accept_prob);
        self.accepted.append_value(stats.accepted);
        self.diverging.append_value(stats.diverging);
        self.tree_depth.append_option(stats.tree_depth);
        self.maxdepth_reached.append_value(stats.maxdepth_reached);
        self.energy.append_option(stats.energy);
        self.energy_error.append_option(stats.energy_error);
        self.step_size.append_value(stats.step_size);
        self.n_steps.append_value(stats.n_steps);
    }

    fn finish(mut self, block: usize) -> Vec<(String, ArrayRef, bool)> {
        let name = |stat: &str| format!("step.{}.{}", block, stat);
        vec![
            (name("accept_prob"), Arc::new(self.accept_prob.finish()) as ArrayRef, false),
            (name("accepted"), Arc::new(self.accepted.finish()) as ArrayRef, false),
            (name("diverging"), Arc::new(self.diverging.finish()) as ArrayRef, false),
            (name("tree_depth"), Arc::new(self.tree_depth.finish()) as ArrayRef, true),
            (name("maxdepth_reached"), Arc::new(self.maxdepth_reached.finish()) as ArrayRef, false),
            (name("energy"), Arc::new(self.energy.finish()) as ArrayRef, true),
            (name("energy_error"), Arc::new(self.energy_error.finish()) as ArrayRef, true),
            (name("step_size"), Arc::new(self.step_size.finish()) as ArrayRef, false),
            (name("n_steps"), Arc::new(self.n_steps.finish()) as ArrayRef, false),
        ]
    }
}

/// Convert a trace into a record batch with one row per draw.
pub fn trace_to_record_batch(
    trace: &Trace,
    blocks: &[BlockAssignment],
    dim: usize,
) -> Result<RecordBatch> {
    let num_draws = trace.draws.len();
    let mut chain = UInt64Builder::with_capacity(num_draws);
    let mut draw_idx = UInt64Builder::with_capacity(num_draws);
    let mut tuning = BooleanBuilder::with_capacity(num_draws);
    let mut logp = Float64Builder::with_capacity(num_draws);
    let mut position = FixedSizeListBuilder::with_capacity(
        Float64Builder::with_capacity(num_draws * dim),
        dim as i32,
        num_draws,
    )
    .with_field(Field::new("item", arrow::datatypes::DataType::Float64, false));
    let mut stats: Vec<StatBuilders> = blocks
        .iter()
        .map(|_| StatBuilders::with_capacity(num_draws))
        .collect();

    for (idx, draw) in trace.draws.iter().enumerate() {
        if draw.position.len() != dim || draw.stats.len() != blocks.len() {
            return Err(SamplerError::InvalidTrace(format!(
                "draw {} of chain {} does not match the ensemble layout",
                idx, trace.chain
            )));
        }
        chain.append_value(trace.chain);
        draw_idx.append_value(idx as u64);
        tuning.append_value(draw.tuning);
        logp.append_value(draw.logp);
        position.values().append_slice(&draw.position);
        position.append(true);
        stats
            .iter_mut()
            .zip(draw.stats.iter())
            .for_each(|(builder, stat)| builder.append(stat));
    }

    let mut columns: Vec<(String, ArrayRef, bool)> = vec![
        ("chain".into(), Arc::new(chain.finish()) as ArrayRef, false),
        ("draw".into(), Arc::new(draw_idx.finish()) as ArrayRef, false),
        ("tuning".into(), Arc::new(tuning.finish()) as ArrayRef, false),
        ("logp".into(), Arc::new(logp.finish()) as ArrayRef, false),
        ("position".into(), Arc::new(position.finish()) as ArrayRef, false),
    ];
    for (block, builder) in stats.into_iter().enumerate() {
        columns.extend(builder.finish(block));
    }

    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array, nullable)| Field::new(name, array.data_type().clone(), *nullable))
        .collect();
    let arrays = columns.into_iter().map(|(_, array, _)| array).collect();
    let options = RecordBatchOptions::new().with_row_count(Some(num_draws));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        arrays,
        &options,
    )?)
}

fn column<'a, A: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a A> {
    batch
        .column_by_name(name)
        .and_then(|array| array.as_any().downcast_ref::<A>())
        .ok_or_else(|| SamplerError::InvalidTrace(format!("missing or invalid column `{}`", name)))
}

fn optional<T>(present: bool, value: T) -> Option<T> {
    present.then_some(value)
}

struct StatColumns<'a> {
    accept_prob: &'a Float64Array,
    accepted: &'a BooleanArray,
    diverging: &'a BooleanArray,
    tree_depth: &'a UInt64Array,
    maxdepth_reached: &'a BooleanArray,
    energy: &'a Float64Array,
    energy_error: &'a Float64Array,
    step_size: &'a Float64Array,
    n_steps: &'a UInt64Array,
}

impl<'a> StatColumns<'a> {
    fn new(batch: &'a RecordBatch, block: usize) -> Result<Self> {
        let name = |stat: &str| format!("step.{}.{}", block, stat);
        Ok(Self {
            accept_prob: column(batch, &name("accept_prob"))?,
            accepted: column(batch, &name("accepted"))?,
            diverging: column(batch, &name("diverging"))?,
            tree_depth: column(batch, &name("tree_depth"))?,
            maxdepth_reached: column(batch, &name("maxdepth_reached"))?,
            energy: column(batch, &name("energy"))?,
            energy_error: column(batch, &name("energy_error"))?,
            step_size: column(batch, &name("step_size"))?,
            n_steps: column(batch, &name("n_steps"))?,
        })
    }

    fn get(&self, block: &BlockAssignment, row: usize) -> StepStats {
        StepStats {
            method: block.method,
            accept_prob: self.accept_prob.value(row),
            accepted: self.accepted.value(row),
            diverging: self.diverging.value(row),
            tree_depth: optional(self.tree_depth.is_valid(row), self.tree_depth.value(row)),
            maxdepth_reached: self.maxdepth_reached.value(row),
            energy: optional(self.energy.is_valid(row), self.energy.value(row)),
            energy_error: optional(self.energy_error.is_valid(row), self.energy_error.value(row)),
            step_size: self.step_size.value(row),
            n_steps: self.n_steps.value(row),
        }
    }
}

/// Read the draws of one trace back from a record batch.
pub fn draws_from_record_batch(
    batch: &RecordBatch,
    blocks: &[BlockAssignment],
    dim: usize,
) -> Result<Vec<Draw>> {
    let tuning: &BooleanArray = column(batch, "tuning")?;
    let logp: &Float64Array = column(batch, "logp")?;
    let position: &FixedSizeListArray = column(batch, "position")?;
    if position.value_length() as usize != dim {
        return Err(SamplerError::InvalidTrace(format!(
            "expected positions of length {}, found {}",
            dim,
            position.value_length()
        )));
    }
    let stats = blocks
        .iter()
        .enumerate()
        .map(|(idx, _)| StatColumns::new(batch, idx))
        .collect::<Result<Vec<_>>>()?;

    (0..batch.num_rows())
        .map(|row| {
            let values = position.value(row);
            let values = values
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| SamplerError::InvalidTrace("positions are not f64".into()))?;
            Ok(Draw {
                position: values.values().iter().copied().collect(),
                logp: logp.value(row),
                tuning: tuning.value(row),
                stats: stats
                    .iter()
                    .zip(blocks.iter())
                    .map(|(columns, block)| columns.get(block, row))
                    .collect(),
            })
        })
        .collect()
}

fn ensemble_schema(ensemble: &Ensemble, batch_schema: &Schema) -> Result<SchemaRef> {
    let header = EnsembleHeader {
        variables: ensemble.variables.clone(),
        blocks: ensemble.blocks.clone(),
        seed: ensemble.seed,
        traces: ensemble
            .traces
            .iter()
            .map(|trace| TraceHeader {
                chain: trace.chain,
                status: trace.status,
                draws: trace.draws.len(),
            })
            .collect(),
        failures: ensemble
            .failures
            .iter()
            .map(|failure| FailureHeader {
                chain: failure.chain,
                message: failure.error.to_string(),
            })
            .collect(),
    };
    let metadata = HashMap::from([(METADATA_KEY.to_string(), serde_json::to_string(&header)?)]);
    Ok(Arc::new(batch_schema.clone().with_metadata(metadata)))
}

/// Write an ensemble as an Arrow IPC stream.
pub fn write_ensemble<W: Write>(ensemble: &Ensemble, writer: W) -> Result<()> {
    let dim = dimension(&ensemble.variables);
    let empty = Trace::new(0);
    let batches = ensemble
        .traces
        .iter()
        .map(|trace| trace_to_record_batch(trace, &ensemble.blocks, dim))
        .collect::<Result<Vec<_>>>()?;
    let batch_schema = match batches.first() {
        Some(batch) => batch.schema(),
        None => trace_to_record_batch(&empty, &ensemble.blocks, dim)?.schema(),
    };
    let schema = ensemble_schema(ensemble, &batch_schema)?;

    let mut writer = StreamWriter::try_new(writer, &schema)?;
    for batch in batches {
        let batch = batch.with_schema(schema.clone())?;
        writer.write(&batch)?;
    }
    writer.finish()?;
    Ok(())
}

/// Read an ensemble written by [`write_ensemble`].
///
/// Chain failures come back as [`SamplerError::ChainFailed`] with the
/// original error message.
pub fn read_ensemble<R: Read>(reader: R) -> Result<Ensemble> {
    let reader = StreamReader::try_new(reader, None)?;
    let schema = reader.schema();
    let header = schema
        .metadata()
        .get(METADATA_KEY)
        .ok_or_else(|| SamplerError::InvalidTrace("missing ensemble metadata".into()))?;
    let header: EnsembleHeader = serde_json::from_str(header)?;
    let dim = dimension(&header.variables);

    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    if batches.len() != header.traces.len() {
        return Err(SamplerError::InvalidTrace(format!(
            "expected {} traces, found {}",
            header.traces.len(),
            batches.len()
        )));
    }

    let traces = header
        .traces
        .iter()
        .zip(batches.iter())
        .map(|(trace, batch)| {
            let draws = draws_from_record_batch(batch, &header.blocks, dim)?;
            if draws.len() != trace.draws {
                return Err(SamplerError::InvalidTrace(format!(
                    "chain {} should have {} draws, found {}",
                    trace.chain,
                    trace.draws,
                    draws.len()
                )));
            }
            Ok(Trace {
                chain: trace.chain,
                status: trace.status,
                draws,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let failures = header
        .failures
        .into_iter()
        .map(|failure| ChainFailure {
            chain: failure.chain,
            error: SamplerError::ChainFailed {
                chain: failure.chain,
                message: failure.message,
            },
        })
        .collect();

    Ok(Ensemble {
        variables: header.variables,
        blocks: header.blocks,
        seed: header.seed,
        traces,
        failures,
    })
}

impl Ensemble {
    pub fn to_ipc_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        write_ensemble(self, &mut buffer)?;
        Ok(buffer)
    }

    pub fn from_ipc_bytes(bytes: &[u8]) -> Result<Self> {
        read_ensemble(Cursor::new(bytes))
    }
}
