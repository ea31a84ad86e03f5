// SPDX-License-Identifier: CEPL-1.0
//! Per-frame entity buckets.

use std::cmp::Ordering;

use refresh_math::Vec3;
use refresh_render::{Entity, ModelRef, RenderFlags};

/// Indices into the frame's entity list, one bucket per draw stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderQueues {
    pub bmodels: Vec<usize>,
    pub opaque: Vec<usize>,
    /// Translucent, drawn before effects, farthest first.
    pub alpha_back: Vec<usize>,
    /// Weapon models and faint translucents, drawn after effects, nearest first.
    pub alpha_front: Vec<usize>,
    pub beams: Vec<usize>,
    pub flares: Vec<usize>,
}

fn translucent_alpha(entity: &Entity) -> f32 {
    if entity.alpha.is_finite() {
        entity.alpha
    } else {
        1.0
    }
}

/// `None` for origins that give no usable distance.
fn distance_key(entity: &Entity, view: Vec3) -> Option<f32> {
    Some(entity.origin.distance_squared(view)).filter(|d| d.is_finite())
}

/// Orders finite distances with `cmp` and puts unusable ones after them.
fn by_distance(a: Option<f32>, b: Option<f32>, cmp: impl Fn(f32, f32) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl RenderQueues {
    pub fn clear(&mut self) {
        self.bmodels.clear();
        self.opaque.clear();
        self.alpha_back.clear();
        self.alpha_front.clear();
        self.beams.clear();
        self.flares.clear();
    }

    pub fn classify(&mut self, entities: &[Entity], draw_order_threshold: f32) {
        self.clear();
        for (i, e) in entities.iter().enumerate() {
            if e.flags.contains(RenderFlags::BEAM) {
                if e.frame != 0 {
                    self.beams.push(i);
                }
                continue;
            }
            if e.flags.contains(RenderFlags::FLARE) {
                self.flares.push(i);
                continue;
            }
            if matches!(e.model.resolve(), ModelRef::Inline(_)) {
                self.bmodels.push(i);
                continue;
            }
            if !e.flags.contains(RenderFlags::TRANSLUCENT) {
                self.opaque.push(i);
                continue;
            }
            let near = e.flags.contains(RenderFlags::WEAPONMODEL) || translucent_alpha(e) <= draw_order_threshold;
            if near {
                self.alpha_front.push(i);
            } else {
                self.alpha_back.push(i);
            }
        }
    }

    /// Stable sort of the transparency buckets: `alpha_back` farthest first,
    /// `alpha_front` nearest first. Entities without a finite distance go last
    /// in both.
    pub fn sort_transparent(&mut self, entities: &[Entity], view: Vec3) {
        let key = |i: usize| distance_key(&entities[i], view);
        self.alpha_back.sort_by(|&a, &b| by_distance(key(a), key(b), |a, b| b.total_cmp(&a)));
        self.alpha_front.sort_by(|&a, &b| by_distance(key(a), key(b), |a, b| a.total_cmp(&b)));
    }

    /// `alpha_back` in draw order.
    pub fn alpha_back_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.alpha_back.iter().copied()
    }

    pub fn alpha_front_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.alpha_front.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.bmodels.len()
            + self.opaque.len()
            + self.alpha_back.len()
            + self.alpha_front.len()
            + self.beams.len()
            + self.flares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
