use rand::Rng;

use crate::{
    adapt_strategy::{new_collector, HamiltonianAdapt, HamiltonianCollector},
    hamiltonian::{Collector, Direction, DivergenceInfo, EuclideanHamiltonian, SampleInfo},
    math::{accept_probability, axpy, logaddexp, scalar_prods2},
    model::{BoxedLogpError, LogDensity},
    state::State,
    step_method::{StepMethodKind, StepStats},
};

pub(crate) struct NutsOptions {
    pub(crate) maxdepth: u64,
}

/// A part of the trajectory tree during NUTS sampling.
#[derive(Debug)]
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller idx_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: State,
    right: State,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: State,
    /// Sum of the momenta of all points in the tree.
    rho: Box<[f64]>,
    log_size: f64,
    depth: u64,
}

/// Outcome of building a new subtree at the edge of the trajectory.
enum Subtree {
    Ok(NutsTree),
    /// The subtree contains a U-turn and must be discarded.
    Turning,
    Diverging(DivergenceInfo),
}

impl NutsTree {
    fn new(state: State) -> NutsTree {
        NutsTree::leaf(state, 0.)
    }

    fn leaf(state: State, log_size: f64) -> NutsTree {
        NutsTree {
            rho: state.p.clone(),
            right: state.clone(),
            left: state.clone(),
            draw: state,
            log_size,
            depth: 0,
        }
    }

    /// The point where the trajectory continues in `direction`.
    fn edge(&self, direction: Direction) -> &State {
        match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        }
    }

    /// Merge a tree of the same depth that continues this one in `direction`.
    ///
    /// The main tree (the one containing the initial point) prefers draws from
    /// the new subtree, inner subtrees use multinomial sampling. Returns true
    /// if the combined trajectory makes a U-turn.
    fn merge_into<R: Rng + ?Sized>(
        &mut self,
        other: NutsTree,
        rng: &mut R,
        direction: Direction,
        is_main: bool,
    ) -> bool {
        debug_assert!(self.depth == other.depth);
        let turning = match direction {
            Direction::Forward => is_turning(self, &other),
            Direction::Backward => is_turning(&other, self),
        };

        let log_size = logaddexp(self.log_size, other.log_size);
        let self_log_size = if is_main { self.log_size } else { log_size };

        if (other.log_size >= self_log_size)
            || rng.random_bool(accept_probability(other.log_size - self_log_size))
        {
            self.draw = other.draw;
        }

        axpy(&other.rho, &mut self.rho, 1.);
        match direction {
            Direction::Forward => self.right = other.right,
            Direction::Backward => self.left = other.left,
        }
        self.depth += 1;
        self.log_size = log_size;
        turning
    }

    fn info(
        &self,
        maxdepth: bool,
        divergence_info: Option<DivergenceInfo>,
        n_steps: u64,
    ) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
            n_steps,
        }
    }
}

/// Generalized no-U-turn criterion for two adjacent trees.
///
/// Besides the combined trajectory, the two extended sub-trajectories that
/// cross the boundary are checked as well.
fn is_turning(left: &NutsTree, right: &NutsTree) -> bool {
    let (start, end) = scalar_prods2(&left.rho, &right.rho, &left.left.v, &right.right.v);
    if (start < 0.) | (end < 0.) {
        return true;
    }
    if left.depth == 0 {
        return false;
    }
    let (start, end) = scalar_prods2(&left.rho, &right.left.p, &left.left.v, &right.left.v);
    if (start < 0.) | (end < 0.) {
        return true;
    }
    let (start, end) = scalar_prods2(&left.right.p, &right.rho, &left.right.v, &right.right.v);
    (start < 0.) | (end < 0.)
}

/// Build a tree with `2^depth` leapfrog steps starting after `start`.
///
/// Finished subtrees wait on a stack until their sibling of the same
/// depth is complete, so at most `depth + 1` trees are alive at any time.
#[allow(clippy::too_many_arguments)]
fn build_subtree<T, R, C>(
    hamiltonian: &mut EuclideanHamiltonian,
    target: &T,
    start: &State,
    depth: u64,
    direction: Direction,
    initial_energy: f64,
    rng: &mut R,
    collector: &mut C,
    n_steps: &mut u64,
) -> Result<Subtree, BoxedLogpError>
where
    T: LogDensity + ?Sized,
    R: Rng + ?Sized,
    C: Collector,
{
    let mut stack: Vec<NutsTree> = Vec::with_capacity(depth as usize + 1);
    for _ in 0..(1u64 << depth) {
        let end = {
            let from = stack.last().map_or(start, |tree| tree.edge(direction));
            hamiltonian.leapfrog(target, from, direction, initial_energy, collector)?
        };
        *n_steps += 1;
        let end = match end {
            Ok(end) => end,
            Err(info) => return Ok(Subtree::Diverging(info)),
        };

        let log_size = initial_energy - end.energy();
        let mut tree = NutsTree::leaf(end, log_size);
        while stack.last().is_some_and(|top| top.depth == tree.depth) {
            let Some(mut earlier) = stack.pop() else {
                break;
            };
            if earlier.merge_into(tree, rng, direction, false) {
                return Ok(Subtree::Turning);
            }
            tree = earlier;
        }
        stack.push(tree);
    }
    debug_assert!(stack.len() == 1);
    Ok(stack.pop().map_or(Subtree::Turning, Subtree::Ok))
}

/// Draw a new state with the No-U-Turn Sampler.
///
/// The momentum of `init` is resampled in place.
pub(crate) fn draw<T, R, C>(
    hamiltonian: &mut EuclideanHamiltonian,
    target: &T,
    init: &mut State,
    rng: &mut R,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(State, SampleInfo), BoxedLogpError>
where
    T: LogDensity + ?Sized,
    R: Rng + ?Sized,
    C: Collector,
{
    hamiltonian.randomize_momentum(init, rng);
    init.make_init_point();
    collector.register_init(init);
    let initial_energy = init.energy();

    let mut tree = NutsTree::new(init.clone());
    let mut n_steps = 0;
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        let subtree = build_subtree(
            hamiltonian,
            target,
            tree.edge(direction),
            tree.depth,
            direction,
            initial_energy,
            rng,
            collector,
            &mut n_steps,
        )?;
        let (turning, divergence) = match subtree {
            Subtree::Ok(other) => (tree.merge_into(other, rng, direction, true), None),
            Subtree::Turning => (true, None),
            Subtree::Diverging(info) => (true, Some(info)),
        };
        if turning {
            let info = tree.info(false, divergence, n_steps);
            collector.register_draw(&tree.draw, &info);
            return Ok((tree.draw, info));
        }
    }
    let info = tree.info(true, None, n_steps);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}

/// Phase space point of the last draw and the parameter vector it belongs to.
#[derive(Debug, Clone)]
pub(crate) struct CachedState {
    position: Box<[f64]>,
    state: State,
}

/// Get a phase space point for the current chain position, reusing the
/// cached one if no other step method moved the chain since.
pub(crate) fn state_at<T: LogDensity + ?Sized>(
    hamiltonian: &mut EuclideanHamiltonian,
    target: &T,
    cache: &mut Option<CachedState>,
    position: &[f64],
) -> Result<State, BoxedLogpError> {
    match cache.take() {
        Some(cached) if *cached.position == *position => {
            hamiltonian.set_context(position);
            Ok(cached.state)
        }
        _ => hamiltonian.init_state(target, position),
    }
}

pub(crate) fn store_state(cache: &mut Option<CachedState>, position: &[f64], state: State) {
    *cache = Some(CachedState {
        position: position.into(),
        state,
    });
}

/// NUTS on one block of coordinates.
#[derive(Debug)]
pub struct NutsStep {
    hamiltonian: EuclideanHamiltonian,
    adapt: HamiltonianAdapt,
    collector: HamiltonianCollector,
    maxdepth: u64,
    cache: Option<CachedState>,
}

impl NutsStep {
    pub(crate) fn new(
        hamiltonian: EuclideanHamiltonian,
        adapt: HamiltonianAdapt,
        maxdepth: u64,
    ) -> Self {
        let dim = hamiltonian.dim();
        NutsStep {
            hamiltonian,
            adapt,
            collector: new_collector(dim),
            maxdepth,
            cache: None,
        }
    }

    pub(crate) fn init<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &mut self,
        target: &T,
        position: &[f64],
        rng: &mut R,
    ) -> Result<(), BoxedLogpError> {
        let state = self.hamiltonian.init_state(target, position)?;
        self.adapt.init(&mut self.hamiltonian, target, &state, rng)?;
        store_state(&mut self.cache, position, state);
        Ok(())
    }

    /// Replace the block coordinates of `position` with a NUTS draw.
    ///
    /// Returns the new log density together with the statistics of the draw.
    pub(crate) fn step<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &mut self,
        target: &T,
        position: &mut [f64],
        rng: &mut R,
        draw_idx: u64,
        tuning: bool,
    ) -> Result<(f64, StepStats), BoxedLogpError> {
        let mut init = state_at(&mut self.hamiltonian, target, &mut self.cache, position)?;
        let options = NutsOptions {
            maxdepth: self.maxdepth,
        };
        let step_size = self.hamiltonian.step_size;
        let (state, info) = draw(
            &mut self.hamiltonian,
            target,
            &mut init,
            rng,
            &options,
            &mut self.collector,
        )?;
        let initial_energy = init.energy();
        let accept_prob = self.collector.collector1.mean.current();

        self.hamiltonian.write_full_position(&state, position);
        let logp = state.logp();
        let stats = StepStats {
            method: StepMethodKind::Nuts,
            accept_prob,
            accepted: state.idx_in_trajectory != 0,
            diverging: info.divergence_info.is_some(),
            tree_depth: Some(info.depth),
            maxdepth_reached: info.reached_maxdepth,
            energy: Some(state.energy()),
            energy_error: Some(state.energy() - initial_energy),
            step_size,
            n_steps: info.n_steps,
        };

        if tuning {
            self.adapt.adapt(
                &mut self.hamiltonian,
                draw_idx,
                accept_prob,
                &self.collector.collector2,
            );
        }
        store_state(&mut self.cache, position, state);
        Ok((logp, stats))
    }

    pub(crate) fn finish_tuning(&mut self) {
        self.adapt.finish_tuning(&mut self.hamiltonian);
    }

    #[cfg(test)]
    pub(crate) fn step_size(&self) -> f64 {
        self.hamiltonian.step_size
    }
}
