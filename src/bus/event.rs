use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::module::result::VisionResult;

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceType {
    Websocket,
    Http,
    Telemetry,
    VisionModule,
    Other,
}

impl SourceType {
    pub const ALL: [SourceType; 5] = [
        SourceType::Websocket,
        SourceType::Http,
        SourceType::Telemetry,
        SourceType::VisionModule,
        SourceType::Other,
    ];
}

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DestType {
    ActiveModule,
    ActivePipelineSettings,
    GeneralSettings,
    #[serde(rename = "UI")]
    Ui,
    Other,
}

impl DestType {
    pub const ALL: [DestType; 5] = [
        DestType::ActiveModule,
        DestType::ActivePipelineSettings,
        DestType::GeneralSettings,
        DestType::Ui,
        DestType::Other,
    ];
}

/// Event payload: a settings value from the transport, or a vision
/// result from a module.
#[derive(Debug, Clone)]
pub enum EventValue {
    Json(Value),
    Result(Arc<VisionResult>),
}

impl EventValue {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            EventValue::Json(v) => Some(v),
            EventValue::Result(_) => None,
        }
    }

    pub fn as_result(&self) -> Option<&Arc<VisionResult>> {
        match self {
            EventValue::Result(r) => Some(r),
            EventValue::Json(_) => None,
        }
    }
}

/// A change notification carried by the bus. Immutable once built.
#[derive(Debug, Clone)]
pub struct DataChangeEvent {
    source: SourceType,
    dest: DestType,
    property_name: String,
    value: EventValue,
    originating_index: Option<usize>,
}

impl DataChangeEvent {
    pub fn new(
        source: SourceType,
        dest: DestType,
        property_name: impl Into<String>,
        value: EventValue,
    ) -> Self {
        Self {
            source,
            dest,
            property_name: property_name.into(),
            value,
            originating_index: None,
        }
    }

    /// Settings change carrying a JSON value.
    pub fn json(
        source: SourceType,
        dest: DestType,
        property_name: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::new(source, dest, property_name, EventValue::Json(value))
    }

    /// Result published by a vision module, addressed to the UI.
    pub fn vision_result(result: Arc<VisionResult>) -> Self {
        let index = result.camera_index;
        Self::new(
            SourceType::VisionModule,
            DestType::Ui,
            "result",
            EventValue::Result(result),
        )
        .with_index(index)
    }

    /// Tag the event with the index of the module it concerns.
    pub fn with_index(mut self, index: usize) -> Self {
        self.originating_index = Some(index);
        self
    }

    pub fn source(&self) -> SourceType {
        self.source
    }

    pub fn dest(&self) -> DestType {
        self.dest
    }

    pub fn property_name(&self) -> &str {
        &self.property_name
    }

    pub fn value(&self) -> &EventValue {
        &self.value
    }

    pub fn originating_index(&self) -> Option<usize> {
        self.originating_index
    }
}

/// Source and destination sets a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventFilter {
    sources: BTreeSet<SourceType>,
    dests: BTreeSet<DestType>,
}

impl EventFilter {
    pub fn new(
        sources: impl IntoIterator<Item = SourceType>,
        dests: impl IntoIterator<Item = DestType>,
    ) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            dests: dests.into_iter().collect(),
        }
    }

    /// Every source, every destination.
    pub fn all() -> Self {
        Self::new(SourceType::ALL, DestType::ALL)
    }

    pub fn matches(&self, event: &DataChangeEvent) -> bool {
        self.sources.contains(&event.source) && self.dests.contains(&event.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_requires_both_source_and_destination() {
        let filter = EventFilter::new([SourceType::Http], [DestType::GeneralSettings]);
        let both = DataChangeEvent::json(
            SourceType::Http,
            DestType::GeneralSettings,
            "teamNumber",
            json!(254),
        );
        let wrong_source = DataChangeEvent::json(
            SourceType::Websocket,
            DestType::GeneralSettings,
            "teamNumber",
            json!(254),
        );
        let wrong_dest =
            DataChangeEvent::json(SourceType::Http, DestType::Ui, "teamNumber", json!(254));

        assert!(filter.matches(&both));
        assert!(!filter.matches(&wrong_source));
        assert!(!filter.matches(&wrong_dest));
    }

    #[test]
    fn all_filter_matches_every_combination() {
        let filter = EventFilter::all();
        for source in SourceType::ALL {
            for dest in DestType::ALL {
                let event = DataChangeEvent::json(source, dest, "x", Value::Null);
                assert!(filter.matches(&event), "{source:?} -> {dest:?}");
            }
        }
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = EventFilter::new([], []);
        let event = DataChangeEvent::json(SourceType::Other, DestType::Other, "x", Value::Null);
        assert!(!filter.matches(&event));
    }

    #[test]
    fn with_index_sets_originating_index() {
        let event = DataChangeEvent::json(
            SourceType::Websocket,
            DestType::ActiveModule,
            "exposure",
            json!(20),
        );
        assert_eq!(event.originating_index(), None);
        let event = event.with_index(2);
        assert_eq!(event.originating_index(), Some(2));
        assert_eq!(event.value().as_json(), Some(&json!(20)));
        assert!(event.value().as_result().is_none());
    }

    #[test]
    fn dest_serialises_ui_in_caps() {
        assert_eq!(serde_json::to_value(DestType::Ui).unwrap(), "UI");
        assert_eq!(
            serde_json::to_value(DestType::ActivePipelineSettings).unwrap(),
            "activePipelineSettings"
        );
    }
}
