// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::match_result_ok,
    clippy::cmp_owned,
    clippy::cmp_null,
    clippy::op_ref
)]

#[macro_use]
extern crate serde;

pub mod config;
pub mod connections;
pub mod coordinates;
pub mod drawing;
pub mod ingest;
pub mod models;
pub mod network_graph;
pub mod persistence;
pub mod point_index;
pub mod properties;
pub mod route_edit;
pub mod routing_service;

/// `[longitude, latitude]` in WGS84 degrees.
pub type LngLat = [f64; 2];

/// Display colour of already-laid cable.
pub const EXISTING_COLOR: &str = "#008000";
/// Display colour of planned cable.
pub const PROPOSED_COLOR: &str = "#FF0000";

pub fn lnglat_to_point(c: &LngLat) -> geo::Point<f64> {
    geo::Point::new(c[0], c[1])
}
