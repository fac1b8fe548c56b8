//! Google Maps style HTTP routing provider (distance matrix + directions).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::coord::Coordinate;
use crate::error::GeoError;
use crate::provider::{Route, RouteLeg, RouteStep, RoutingProvider};

pub struct GoogleMapsProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GoogleMapsProvider {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, GeoError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl RoutingProvider for GoogleMapsProvider {
    async fn distance_matrix(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<RouteLeg, GeoError> {
        let url = format!("{}/distancematrix/json", self.base_url);
        let response: DistanceMatrixResponse = self
            .client
            .get(url)
            .query(&[
                ("origins", origin.to_query()),
                ("destinations", destination.to_query()),
                ("units", "metric".to_string()),
                ("key", self.api_key.clone()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_distance_matrix(response)
    }

    async fn directions(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<Option<Route>, GeoError> {
        let url = format!("{}/directions/json", self.base_url);
        let response: DirectionsResponse = self
            .client
            .get(url)
            .query(&[
                ("origin", origin.to_query()),
                ("destination", destination.to_query()),
                ("mode", "driving".to_string()),
                ("key", self.api_key.clone()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_directions(response)
    }
}

#[derive(Debug, Deserialize)]
pub struct DistanceMatrixResponse {
    pub status: String,
    #[serde(default)]
    pub rows: Vec<MatrixRow>,
}

#[derive(Debug, Deserialize)]
pub struct MatrixRow {
    #[serde(default)]
    pub elements: Vec<MatrixElement>,
}

#[derive(Debug, Deserialize)]
pub struct MatrixElement {
    pub status: String,
    pub distance: Option<TextValue>,
    pub duration: Option<TextValue>,
}

#[derive(Debug, Deserialize)]
pub struct TextValue {
    pub text: String,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
pub struct DirectionsResponse {
    pub status: String,
    #[serde(default)]
    pub routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
pub struct DirectionsRoute {
    pub overview_polyline: Polyline,
    #[serde(default)]
    pub legs: Vec<DirectionsLeg>,
}

#[derive(Debug, Deserialize)]
pub struct Polyline {
    pub points: String,
}

#[derive(Debug, Deserialize)]
pub struct DirectionsLeg {
    pub distance: TextValue,
    pub duration: TextValue,
    #[serde(default)]
    pub steps: Vec<DirectionsStep>,
}

#[derive(Debug, Deserialize)]
pub struct DirectionsStep {
    #[serde(default)]
    pub html_instructions: String,
    pub distance: TextValue,
    pub duration: TextValue,
    pub start_location: LatLng,
    pub end_location: LatLng,
}

#[derive(Debug, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl From<&LatLng> for Coordinate {
    fn from(value: &LatLng) -> Self {
        Coordinate::new(value.lat, value.lng)
    }
}

fn leg_from(distance: &TextValue, duration: &TextValue) -> RouteLeg {
    RouteLeg {
        distance_km: distance.value / 1000.0,
        duration_min: duration.value / 60.0,
        distance_text: distance.text.clone(),
        duration_text: duration.text.clone(),
    }
}

pub fn parse_distance_matrix(response: DistanceMatrixResponse) -> Result<RouteLeg, GeoError> {
    if response.status != "OK" {
        return Err(GeoError::Status(response.status));
    }
    let element = response
        .rows
        .first()
        .and_then(|row| row.elements.first())
        .ok_or_else(|| GeoError::Decode("distance matrix without elements".to_string()))?;
    if element.status != "OK" {
        return Err(GeoError::Status(element.status.clone()));
    }
    match (&element.distance, &element.duration) {
        (Some(distance), Some(duration)) => Ok(leg_from(distance, duration)),
        _ => Err(GeoError::Decode("element without distance/duration".to_string())),
    }
}

pub fn parse_directions(response: DirectionsResponse) -> Result<Option<Route>, GeoError> {
    match response.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" | "NOT_FOUND" => return Ok(None),
        _ => return Err(GeoError::Status(response.status)),
    }
    let Some(route) = response.routes.into_iter().next() else {
        return Ok(None);
    };
    let Some(leg) = route.legs.first() else {
        return Ok(None);
    };
    let steps = leg
        .steps
        .iter()
        .map(|step| RouteStep {
            instruction: strip_tags(&step.html_instructions),
            distance: step.distance.text.clone(),
            duration: step.duration.text.clone(),
            start: Coordinate::from(&step.start_location),
            end: Coordinate::from(&step.end_location),
        })
        .collect();
    Ok(Some(Route {
        polyline: route.overview_polyline.points,
        leg: leg_from(&leg.distance, &leg.duration),
        steps,
    }))
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}
