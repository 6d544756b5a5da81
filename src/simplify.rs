use geo::{CoordsIter, MultiPolygon, Polygon, Simplify, SimplifyVwPreserve};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::info;

use crate::types::{County, FeatureCollection};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimplifyAlgorithm {
    /// Ramer-Douglas-Peucker; tolerance is a distance in degrees.
    #[default]
    DouglasPeucker,
    /// Topology-preserving Visvalingam-Whyatt; tolerance is an area in square degrees.
    VisvalingamPreserve,
}

#[derive(Debug, Clone, Copy)]
pub struct SimplifyOptions {
    pub tolerance: f64,
    pub algorithm: SimplifyAlgorithm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimplifyReport {
    pub vertices_before: usize,
    pub vertices_after: usize,
}

pub struct Simplifier {
    options: SimplifyOptions,
}

impl Simplifier {
    pub fn new(options: SimplifyOptions) -> Self {
        Self { options }
    }

    pub fn simplify(&self, collection: FeatureCollection) -> (FeatureCollection, SimplifyReport) {
        let vertices_before = collection.vertex_count();
        info!(
            features = collection.len(),
            vertices = vertices_before,
            tolerance = self.options.tolerance,
            algorithm = ?self.options.algorithm,
            "simplifying geometry"
        );

        let features: Vec<County> = collection
            .features
            .into_par_iter()
            .map(|mut county| {
                county.geometry = self.simplify_geometry(&county.geometry);
                county
            })
            .collect();
        let simplified = FeatureCollection::new(features);

        let report = SimplifyReport { vertices_before, vertices_after: simplified.vertex_count() };
        info!(before = report.vertices_before, after = report.vertices_after, "simplification done");
        (simplified, report)
    }

    /// Simplify one boundary. Collapsed parts are dropped; a county never loses all of its parts.
    pub fn simplify_geometry(&self, geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        if self.options.tolerance <= 0.0 {
            return geometry.clone();
        }
        let parts: Vec<Polygon<f64>> = geometry
            .iter()
            .map(|poly| self.simplify_polygon(poly))
            .filter(|poly| poly.exterior().coords_count() >= 4)
            .collect();
        if parts.is_empty() {
            geometry.clone()
        } else {
            MultiPolygon::new(parts)
        }
    }

    fn simplify_polygon(&self, poly: &Polygon<f64>) -> Polygon<f64> {
        let tolerance = self.options.tolerance;
        let simplified = match self.options.algorithm {
            SimplifyAlgorithm::DouglasPeucker => poly.simplify(&tolerance),
            SimplifyAlgorithm::VisvalingamPreserve => poly.simplify_vw_preserve(&tolerance),
        };
        let interiors = simplified
            .interiors()
            .iter()
            .filter(|ring| ring.coords_count() >= 4)
            .cloned()
            .collect();
        Polygon::new(simplified.exterior().clone(), interiors)
    }
}
