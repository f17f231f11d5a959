use crate::entities::{ExecutionKey, JobDefinition, JobExecution, JobKey};

/// 作业定义同步产生的更新
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionUpdate {
    Add(JobDefinition),
    Update(JobDefinition),
    Remove(JobKey),
}

/// 执行索引对账产生的更新
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionUpdate {
    Add(JobExecution),
    Pause(ExecutionKey),
    Resume(ExecutionKey),
    Delete(ExecutionKey),
}

/// 投递给 WorkerController 的更新消息
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateMessage {
    Definition(DefinitionUpdate),
    Execution(ExecutionUpdate),
}

impl UpdateMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateMessage::Definition(DefinitionUpdate::Add(_)) => "definition.add",
            UpdateMessage::Definition(DefinitionUpdate::Update(_)) => "definition.update",
            UpdateMessage::Definition(DefinitionUpdate::Remove(_)) => "definition.remove",
            UpdateMessage::Execution(ExecutionUpdate::Add(_)) => "execution.add",
            UpdateMessage::Execution(ExecutionUpdate::Pause(_)) => "execution.pause",
            UpdateMessage::Execution(ExecutionUpdate::Resume(_)) => "execution.resume",
            UpdateMessage::Execution(ExecutionUpdate::Delete(_)) => "execution.delete",
        }
    }
}

impl From<DefinitionUpdate> for UpdateMessage {
    fn from(update: DefinitionUpdate) -> Self {
        UpdateMessage::Definition(update)
    }
}

impl From<ExecutionUpdate> for UpdateMessage {
    fn from(update: ExecutionUpdate) -> Self {
        UpdateMessage::Execution(update)
    }
}
