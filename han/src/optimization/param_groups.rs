use std::collections::HashMap;

use log::debug;
use rayon::prelude::*;

use super::Optimizer;
use crate::{
    HanErr, Result,
    arch::{GroupId, ParamSlab, Parameterized},
    config::OptimizerConfig,
};

/// Something that parameter groups can be added to while training is under way.
pub trait ParamRegistry {
    /// Adds a new group of `len` parameters.
    ///
    /// # Returns
    /// An error if `id` was already added.
    fn add_param_group(&mut self, id: GroupId, len: usize) -> Result<()>;
}

struct Group {
    len: usize,
    optimizer: Box<dyn Optimizer + Send>,
}

/// One optimizer per parameter group, all built from the same config.
pub struct ParamGroups {
    config: OptimizerConfig,
    groups: HashMap<GroupId, Group>,
}

impl ParamGroups {
    /// Creates a new `ParamGroups` holding every group `model` currently has.
    pub fn new<M: Parameterized + ?Sized>(config: OptimizerConfig, model: &M) -> Result<Self> {
        let mut groups = Self {
            config,
            groups: HashMap::new(),
        };

        for (id, len) in model.param_groups() {
            groups.add_param_group(id, len)?;
        }

        Ok(groups)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, id: &GroupId) -> bool {
        self.groups.contains_key(id)
    }

    /// Updates every parameter group of `model` with its accumulated gradient, in parallel.
    ///
    /// # Returns
    /// An error if a group of `model` was never added or changed its size.
    pub fn step<M: Parameterized + ?Sized>(&mut self, model: &mut M) -> Result<()> {
        let mut optimizers: HashMap<&GroupId, &mut Group> = self.groups.iter_mut().collect();
        let mut work = Vec::new();

        for (id, slab) in model.groups_mut() {
            let group = optimizers
                .remove(&id)
                .ok_or_else(|| HanErr::UnregisteredGroup(id.clone()))?;

            if slab.len() != group.len {
                return Err(HanErr::SizeMismatch {
                    what: "parameter group",
                    got: slab.len(),
                    expected: group.len,
                });
            }

            work.push((group, slab));
        }

        work.into_par_iter().try_for_each(|(group, slab)| {
            let ParamSlab { params, grad } = slab;
            group.optimizer.update_params(grad, params)
        })
    }
}

impl ParamRegistry for ParamGroups {
    fn add_param_group(&mut self, id: GroupId, len: usize) -> Result<()> {
        if self.groups.contains_key(&id) {
            return Err(HanErr::DuplicateGroup(id));
        }

        debug!(group:% = id, len = len; "added parameter group");

        let optimizer = self.config.build(len);
        self.groups.insert(id, Group { len, optimizer });

        Ok(())
    }
}
