use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::module_update::UpdateType;

/// Kind of side effect a step requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Book an ultrasound or other exam
    ScheduleExam,
    /// Book an injection
    ScheduleInjection,
    /// Book an ET/OPU/flushing procedure
    ScheduleProcedure,
    /// Change a status held by another module
    UpdateStatus,
    /// Notify staff
    Notify,
    /// Hold the workflow for a number of days
    WaitDays,
}

/// External subsystem receiving a module update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetModule {
    /// Scheduling calendar
    Calendar,
    /// Injection planning
    Injection,
    /// Embryo transfer
    Et,
    /// Oocyte pickup
    Opu,
    /// Ultrasound exams
    Ultrasound,
    /// Internal notifications and status
    Internal,
}

impl std::fmt::Display for TargetModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Calendar => "CALENDAR",
            Self::Injection => "INJECTION",
            Self::Et => "ET",
            Self::Opu => "OPU",
            Self::Ultrasound => "ULTRASOUND",
            Self::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// Side effect attached to a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAction {
    /// Action identifier
    pub id: String,

    /// Action kind
    #[serde(rename = "type")]
    pub action_type: ActionType,

    /// Module the resulting update is sent to
    pub target_module: TargetModule,

    /// Free-form parameters (days, medication, dosage, examType, ...)
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl WorkflowAction {
    /// Create an action with no parameters
    pub fn new(id: &str, action_type: ActionType, target_module: TargetModule) -> Self {
        Self {
            id: id.to_string(),
            action_type,
            target_module,
            parameters: Map::new(),
        }
    }

    /// Add a parameter
    pub fn with_parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    /// Days to wait for a `WAIT_DAYS` action
    pub fn wait_days(&self) -> Option<f64> {
        if self.action_type != ActionType::WaitDays {
            return None;
        }
        self.parameters.get("days").and_then(Value::as_f64)
    }

    /// Update type sent to the target module; `None` for actions handled in-engine
    pub fn update_type(&self) -> Option<UpdateType> {
        match self.action_type {
            ActionType::ScheduleExam
            | ActionType::ScheduleInjection
            | ActionType::ScheduleProcedure
            | ActionType::Notify => Some(UpdateType::Create),
            ActionType::UpdateStatus => Some(UpdateType::Update),
            ActionType::WaitDays => None,
        }
    }

    /// Short human-readable summary used for next-action hints
    pub fn describe(&self) -> String {
        let detail = ["examType", "medication", "procedureType", "status", "message"]
            .iter()
            .find_map(|key| self.parameters.get(*key).and_then(Value::as_str));
        match detail {
            Some(detail) => format!("{:?} {} ({})", self.action_type, detail, self.target_module),
            None => format!("{:?} ({})", self.action_type, self.target_module),
        }
    }
}
