//! Off-mesh links, connections the agent can traverse that aren't part of the walkable surface (jumps, ladders, doors).

use bevy::{log::warn, math::Vec3, transform::components::Transform};

use crate::{
    coords::{world_to_recast, BoundingBox},
    settings::{AreaClass, BuildConfig},
    Area,
};

/// Which way an off-mesh link may be traversed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkDirection {
    /// Only from left to right.
    LeftToRight,
    #[default]
    BothWays,
}

/// Link between two points. Positions are in the owning [LinkModifier]'s local space.
#[derive(Clone, Debug, PartialEq)]
pub struct NavigationLink {
    pub left: Vec3,
    pub right: Vec3,
    pub direction: LinkDirection,
    pub snap_radius: f32,
    pub user_id: u32,
    /// ``None`` uses [AreaClass::DEFAULT].
    pub area_class: Option<AreaClass>,
    /// Bitmask of agent indices that can use the link.
    pub supported_agents: u32,
}

impl NavigationLink {
    pub fn new(left: Vec3, right: Vec3) -> Self {
        Self {
            left,
            right,
            direction: LinkDirection::BothWays,
            snap_radius: 0.3,
            user_id: 0,
            area_class: None,
            supported_agents: u32::MAX,
        }
    }

    /// Setter for [`NavigationLink::direction`]
    pub fn with_direction(mut self, direction: LinkDirection) -> Self {
        self.direction = direction;

        self
    }

    /// Setter for [`NavigationLink::area_class`]
    pub fn with_area_class(mut self, area_class: AreaClass) -> Self {
        self.area_class = Some(area_class);

        self
    }

    /// Setter for [`NavigationLink::supported_agents`]
    pub fn with_supported_agents(mut self, supported_agents: u32) -> Self {
        self.supported_agents = supported_agents;

        self
    }
}

/// Link between two segments.
#[derive(Clone, Debug, PartialEq)]
pub struct NavigationSegmentLink {
    pub left_start: Vec3,
    pub left_end: Vec3,
    pub right_start: Vec3,
    pub right_end: Vec3,
    pub direction: LinkDirection,
    pub snap_radius: f32,
    pub user_id: u32,
    pub area_class: AreaClass,
    pub supported_agents: u32,
}

/// Off-mesh links of one navigation element.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinkModifier {
    pub links: Vec<NavigationLink>,
    pub segment_links: Vec<NavigationSegmentLink>,
    pub local_to_world: Transform,
}

impl LinkModifier {
    /// World space bounds of every link end point.
    pub fn bounds(&self) -> BoundingBox {
        let points = self
            .links
            .iter()
            .flat_map(|link| [link.left, link.right])
            .chain(self.segment_links.iter().flat_map(|link| {
                [link.left_start, link.left_end, link.right_start, link.right_end]
            }));

        BoundingBox::from_points(points.map(|point| self.local_to_world.transform_point(point)))
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.segment_links.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OffMeshConnectionKind {
    Point,
    Segment,
}

/// Resolved off-mesh connection, ready to be written into a navigation tile.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OffMeshConnection {
    pub kind: OffMeshConnectionKind,
    /// Generation space. ``[a0, a1, b0, b1]``, point links repeat ``a0`` & ``b0``.
    pub vertices: [Vec3; 4],
    pub bidirectional: bool,
    pub snap_radius: f32,
    pub user_id: u32,
    pub area: Area,
    pub flags: u16,
}

impl OffMeshConnection {
    pub fn start(&self) -> Vec3 {
        self.vertices[0]
    }
}

/// Resolves the links usable by the configured agent.
///
/// Links using an area class the settings don't know are skipped.
pub(crate) fn build_off_mesh_connections(modifiers: &[LinkModifier], config: &BuildConfig) -> Vec<OffMeshConnection> {
    let agent_mask = 1u32 << config.agent_index;
    let mut connections = Vec::new();

    for modifier in modifiers.iter() {
        let to_recast = |point: Vec3| world_to_recast(modifier.local_to_world.transform_point(point));

        for link in modifier.links.iter() {
            if link.supported_agents & agent_mask == 0 {
                continue;
            }

            let area_class = link.area_class.unwrap_or(AreaClass::DEFAULT);
            let Some(area) = config.resolve_area_class(area_class) else {
                warn!("Trying to use undefined area class while defining off-mesh links! ({})", area_class.0);
                continue;
            };

            let (a, b) = (to_recast(link.left), to_recast(link.right));
            connections.push(OffMeshConnection {
                kind: OffMeshConnectionKind::Point,
                vertices: [a, a, b, b],
                bidirectional: link.direction == LinkDirection::BothWays,
                snap_radius: link.snap_radius,
                user_id: link.user_id,
                area,
                flags: config.flags_for_area(area),
            });
        }

        for link in modifier.segment_links.iter() {
            if link.supported_agents & agent_mask == 0 {
                continue;
            }

            let Some(area) = config.resolve_area_class(link.area_class) else {
                warn!("Trying to use undefined area class while defining off-mesh links! ({})", link.area_class.0);
                continue;
            };

            connections.push(OffMeshConnection {
                kind: OffMeshConnectionKind::Segment,
                vertices: [
                    to_recast(link.left_start),
                    to_recast(link.left_end),
                    to_recast(link.right_start),
                    to_recast(link.right_end),
                ],
                bidirectional: link.direction == LinkDirection::BothWays,
                snap_radius: link.snap_radius,
                user_id: link.user_id,
                area,
                flags: config.flags_for_area(area),
            });
        }
    }

    connections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::NavMeshSettings;

    const JUMP: AreaClass = AreaClass("Jump");

    fn config() -> BuildConfig {
        let settings = NavMeshSettings::from_agent(0.5, 2.0).with_area_class(JUMP, Area(5), 0b100);
        BuildConfig::from_settings(&settings).expect("valid settings")
    }

    #[test]
    fn point_links_are_transformed_to_generation_space() {
        let modifier = LinkModifier {
            links: vec![NavigationLink::new(Vec3::ZERO, Vec3::new(0.0, 2.0, 1.0)).with_area_class(JUMP)],
            segment_links: vec![],
            local_to_world: Transform::from_xyz(1.0, 0.0, 0.0),
        };

        let connections = build_off_mesh_connections(&[modifier], &config());

        assert_eq!(connections.len(), 1);
        let connection = &connections[0];
        assert_eq!(connection.kind, OffMeshConnectionKind::Point);
        assert_eq!(connection.start(), Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(connection.vertices[2], Vec3::new(1.0, 1.0, -2.0));
        assert_eq!(connection.area, Area(5));
        assert_eq!(connection.flags, 0b100);
        assert!(connection.bidirectional);
    }

    #[test]
    fn unknown_area_classes_and_other_agents_are_skipped() {
        let modifier = LinkModifier {
            links: vec![
                NavigationLink::new(Vec3::ZERO, Vec3::X).with_area_class(AreaClass("Unknown")),
                NavigationLink::new(Vec3::ZERO, Vec3::X).with_supported_agents(0b10),
                NavigationLink::new(Vec3::ZERO, Vec3::X).with_direction(LinkDirection::LeftToRight),
            ],
            segment_links: vec![NavigationSegmentLink {
                left_start: Vec3::ZERO,
                left_end: Vec3::X,
                right_start: Vec3::Y,
                right_end: Vec3::ONE,
                direction: LinkDirection::BothWays,
                snap_radius: 0.5,
                user_id: 7,
                area_class: JUMP,
                supported_agents: 1,
            }],
            local_to_world: Transform::IDENTITY,
        };

        let connections = build_off_mesh_connections(&[modifier], &config());

        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].area, Area::WALKABLE);
        assert!(!connections[0].bidirectional);
        assert_eq!(connections[1].kind, OffMeshConnectionKind::Segment);
        assert_eq!(connections[1].user_id, 7);
    }
}
