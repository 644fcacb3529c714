//! ParametersActor - session values for a dashboard's parameter definitions
//!
//! Values are not persisted; only definitions live on the dashboard record.
//! Every effective change is reported with the names that changed so the
//! grid can re-run the cells that depend on them.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use shared_types::ParameterDefinition;
use std::collections::BTreeMap;

use super::DashboardError;
use crate::machine::Notifier;

#[derive(Debug, Clone, PartialEq)]
pub enum ParametersUpdate {
    Changed {
        names: Vec<String>,
        values: BTreeMap<String, Value>,
    },
}

#[derive(Debug, Default)]
pub struct ParametersActor;

pub struct ParametersArguments {
    pub dashboard_id: String,
    pub definitions: Vec<ParameterDefinition>,
    pub notify: Notifier<ParametersUpdate>,
}

pub struct ParametersState {
    dashboard_id: String,
    definitions: Vec<ParameterDefinition>,
    values: BTreeMap<String, Value>,
    notify: Notifier<ParametersUpdate>,
}

#[derive(Debug)]
pub enum ParametersMsg {
    SetDefinitions(Vec<ParameterDefinition>),
    Set {
        name: String,
        value: Value,
        reply: RpcReplyPort<Result<(), DashboardError>>,
    },
    GetValues(RpcReplyPort<BTreeMap<String, Value>>),
}

fn defaults(definitions: &[ParameterDefinition]) -> BTreeMap<String, Value> {
    definitions
        .iter()
        .map(|d| (d.name.clone(), d.default_value.clone().unwrap_or(Value::Null)))
        .collect()
}

#[async_trait]
impl Actor for ParametersActor {
    type Msg = ParametersMsg;
    type State = ParametersState;
    type Arguments = ParametersArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            dashboard_id = %args.dashboard_id,
            "ParametersActor starting"
        );
        Ok(ParametersState {
            values: defaults(&args.definitions),
            dashboard_id: args.dashboard_id,
            definitions: args.definitions,
            notify: args.notify,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ParametersMsg::SetDefinitions(definitions) => {
                // Keep what the user already picked for surviving parameters
                let mut values = defaults(&definitions);
                for (name, value) in values.iter_mut() {
                    if let Some(current) = state.values.get(name) {
                        *value = current.clone();
                    }
                }
                let changed: Vec<String> = values
                    .iter()
                    .filter(|(name, value)| state.values.get(*name) != Some(*value))
                    .map(|(name, _)| name.clone())
                    .collect();
                state.definitions = definitions;
                state.values = values;
                if !changed.is_empty() {
                    self.report(state, changed);
                }
            }
            ParametersMsg::Set { name, value, reply } => {
                let result = if !state.definitions.iter().any(|d| d.name == name) {
                    Err(DashboardError::ParameterNotFound(name))
                } else {
                    if state.values.get(&name) != Some(&value) {
                        tracing::debug!(
                            dashboard_id = %state.dashboard_id,
                            parameter = %name,
                            "Parameter value changed"
                        );
                        state.values.insert(name.clone(), value);
                        self.report(state, vec![name]);
                    }
                    Ok(())
                };
                let _ = reply.send(result);
            }
            ParametersMsg::GetValues(reply) => {
                let _ = reply.send(state.values.clone());
            }
        }
        Ok(())
    }
}

impl ParametersActor {
    fn report(&self, state: &ParametersState, names: Vec<String>) {
        (state.notify)(ParametersUpdate::Changed {
            names,
            values: state.values.clone(),
        });
    }
}
