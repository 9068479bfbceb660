use glam::Vec3;
use rapier3d::parry::bounding_volume::{Aabb, BoundingVolume};
use rapier3d::prelude::*;

use crate::ecs::Entity;

/// Rapier world holding one kinematic body per simulated entity. Colliders
/// carry their entity's bits in `user_data`, which is how spatial queries map
/// back to entities.
pub struct PhysicsWorld {
    pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    gravity: Vector,
}

impl Default for PhysicsWorld {
    fn default() -> Self {
        Self::new(crate::net::DEFAULT_TICK_RATE)
    }
}

impl PhysicsWorld {
    pub fn new(tick_rate: u32) -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = 1.0 / tick_rate.max(1) as Real;

        Self {
            pipeline: PhysicsPipeline::new(),
            integration_parameters,
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            gravity: Vector::new(0.0, 0.0, 0.0),
        }
    }

    pub fn step(&mut self) {
        self.pipeline.step(
            self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            &(),
            &(),
        );
    }

    pub fn add_body(&mut self, entity: Entity, position: Vec3, radius: f32) -> RigidBodyHandle {
        let body = RigidBodyBuilder::kinematic_position_based()
            .translation(Vector::new(position.x, position.y, position.z))
            .user_data(u128::from(entity.to_bits()))
            .build();
        let handle = self.bodies.insert(body);

        let collider = ColliderBuilder::ball(radius.max(0.01))
            .user_data(u128::from(entity.to_bits()))
            .build();
        self.colliders
            .insert_with_parent(collider, handle, &mut self.bodies);

        handle
    }

    pub fn remove_body(&mut self, handle: RigidBodyHandle) {
        self.bodies.remove(
            handle,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
    }

    pub fn set_body_position(&mut self, handle: RigidBodyHandle, position: Vec3) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_translation(Vector::new(position.x, position.y, position.z), true);
        }
    }

    pub fn body_position(&self, handle: RigidBodyHandle) -> Option<Vec3> {
        self.bodies.get(handle).map(|b| {
            let t = b.translation();
            Vec3::new(t.x, t.y, t.z)
        })
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    fn query_pipeline(&self) -> QueryPipeline<'_> {
        self.broad_phase.as_query_pipeline(
            self.narrow_phase.query_dispatcher(),
            &self.bodies,
            &self.colliders,
            QueryFilter::default(),
        )
    }

    /// Entities with a collider touching the axis-aligned box centred on
    /// `center` with half size `half_extent` on every axis. Sees colliders as
    /// of the last `step`.
    pub fn query_aabb(&self, center: Vec3, half_extent: f32) -> Vec<Entity> {
        let min = center - Vec3::splat(half_extent);
        let max = center + Vec3::splat(half_extent);
        let aabb = Aabb::new(
            Vector::new(min.x, min.y, min.z),
            Vector::new(max.x, max.y, max.z),
        );

        let query = self.query_pipeline();
        let mut found: Vec<Entity> = query
            .intersect_aabb_conservative(aabb)
            .filter(|(_, collider)| collider.compute_aabb().intersects(&aabb))
            .map(|(_, collider)| Entity::from_bits(collider.user_data as u64))
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::EntityAllocator;

    #[test]
    fn aabb_query_maps_bodies_back_to_entities() {
        let mut alloc = EntityAllocator::new();
        let near = alloc.allocate();
        let far = alloc.allocate();

        let mut physics = PhysicsWorld::default();
        physics.add_body(near, Vec3::new(1.0, 0.0, -2.0), 0.5);
        let far_handle = physics.add_body(far, Vec3::new(30.0, 0.0, 0.0), 0.5);
        physics.step();

        assert_eq!(physics.query_aabb(Vec3::ZERO, 5.0), vec![near]);

        physics.set_body_position(far_handle, Vec3::new(4.0, 4.0, 4.0));
        physics.step();
        assert_eq!(physics.query_aabb(Vec3::ZERO, 5.0), vec![near, far]);
    }

    #[test]
    fn colliders_reaching_into_the_box_are_found() {
        let mut alloc = EntityAllocator::new();
        let edge = alloc.allocate();
        let outside = alloc.allocate();

        let mut physics = PhysicsWorld::default();
        physics.add_body(edge, Vec3::new(5.5, 0.0, 0.0), 1.0);
        physics.add_body(outside, Vec3::new(0.0, 0.0, 7.0), 1.0);
        physics.step();

        assert_eq!(physics.query_aabb(Vec3::ZERO, 5.0), vec![edge]);
    }

    #[test]
    fn removed_bodies_leave_queries() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        let mut physics = PhysicsWorld::default();
        let handle = physics.add_body(e, Vec3::ZERO, 0.5);
        physics.step();

        physics.remove_body(handle);
        physics.step();
        assert!(physics.query_aabb(Vec3::ZERO, 1.0).is_empty());
        assert_eq!(physics.body_count(), 0);
    }
}
