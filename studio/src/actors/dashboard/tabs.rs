//! TabsActor - which page of a dashboard is showing
//!
//! The tab list itself belongs to the dashboard record; this child only
//! tracks selection and keeps it valid as tabs come and go.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::Tab;

use super::DashboardError;
use crate::machine::Notifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabsUpdate {
    ActiveChanged(Option<String>),
}

#[derive(Debug, Default)]
pub struct TabsActor;

pub struct TabsArguments {
    pub dashboard_id: String,
    pub tabs: Vec<Tab>,
    pub notify: Notifier<TabsUpdate>,
}

pub struct TabsState {
    dashboard_id: String,
    tabs: Vec<Tab>,
    active: Option<String>,
    notify: Notifier<TabsUpdate>,
}

#[derive(Debug)]
pub enum TabsMsg {
    /// The dashboard's tab list changed
    SetTabs(Vec<Tab>),
    Select {
        tab_id: String,
        reply: RpcReplyPort<Result<(), DashboardError>>,
    },
    GetActive(RpcReplyPort<Option<String>>),
}

#[async_trait]
impl Actor for TabsActor {
    type Msg = TabsMsg;
    type State = TabsState;
    type Arguments = TabsArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            dashboard_id = %args.dashboard_id,
            tabs = args.tabs.len(),
            "TabsActor starting"
        );
        let active = args.tabs.first().map(|t| t.id.clone());
        Ok(TabsState {
            dashboard_id: args.dashboard_id,
            tabs: args.tabs,
            active,
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
            TabsMsg::SetTabs(tabs) => {
                state.tabs = tabs;
                let still_there = state
                    .active
                    .as_ref()
                    .is_some_and(|id| state.tabs.iter().any(|t| &t.id == id));
                if !still_there {
                    let fallback = state.tabs.first().map(|t| t.id.clone());
                    self.set_active(state, fallback);
                }
            }
            TabsMsg::Select { tab_id, reply } => {
                let result = if state.tabs.iter().any(|t| t.id == tab_id) {
                    self.set_active(state, Some(tab_id));
                    Ok(())
                } else {
                    tracing::debug!(dashboard_id = %state.dashboard_id, tab_id = %tab_id, "Unknown tab selected");
                    Err(DashboardError::TabNotFound(tab_id))
                };
                let _ = reply.send(result);
            }
            TabsMsg::GetActive(reply) => {
                let _ = reply.send(state.active.clone());
            }
        }
        Ok(())
    }
}

impl TabsActor {
    fn set_active(&self, state: &mut TabsState, active: Option<String>) {
        if state.active != active {
            state.active = active.clone();
            (state.notify)(TabsUpdate::ActiveChanged(active));
        }
    }
}
