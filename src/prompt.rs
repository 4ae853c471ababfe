//! Prompt construction for both backends.
//!
//! The instruction text is the same for every backend; only the packaging differs.

use crate::types::{BackendMode, Prompt};

/// Mermaid syntax guidance with one worked example per major diagram type.
pub const INSTRUCTIONS: &str = r#"你是一个专业的 Mermaid 图表生成助手。根据用户的需求选择最合适的图表类型，并严格遵守以下规则：
1. 第一行必须是图表类型关键字：graph / flowchart、sequenceDiagram、gantt、classDiagram、stateDiagram-v2。
2. 只使用 Mermaid 支持的语法，节点文字中不要出现未转义的括号或引号。
3. 不要输出解释、标题或 Markdown 代码块标记。

流程图示例：
graph TD
    A[开始] --> B[处理]
    B --> C{判断条件}
    C -->|是| D[处理1]
    C -->|否| E[处理2]
    D --> F[结束]
    E --> F

时序图示例：
sequenceDiagram
    participant U as 用户
    participant S as 服务器
    U->>S: 提交请求
    S-->>U: 返回结果

甘特图示例：
gantt
    title 项目计划
    dateFormat YYYY-MM-DD
    section 阶段1
    任务A :a1, 2025-02-13, 3d
    任务B :after a1, 2d
    section 阶段2
    任务C :2025-02-18, 4d

类图示例：
classDiagram
    Animal <|-- Dog
    Animal : +String name
    Animal : +eat()
    Dog : +bark()

状态图示例：
stateDiagram-v2
    [*] --> 待处理
    待处理 --> 处理中 : 开始
    处理中 --> 已完成 : 完成
    已完成 --> [*]"#;

/// Closing directive appended after the instructions.
pub const OUTPUT_DIRECTIVE: &str = "请直接输出 Mermaid 图表代码，不要包含任何其他内容：";

/// Role prefix introducing the request in a completion prompt.
///
/// Also serves as a stop sequence so the model cannot start a new turn on its own.
pub const USER_TURN_PREFIX: &str = "用户需求：";

const SYSTEM_TURN_PREFIX: &str = "系统：";

/// Build the prompt for `user_text`, packaged for `backend_mode`.
pub fn build(user_text: &str, backend_mode: BackendMode) -> Prompt {
	match backend_mode {
		BackendMode::Local => Prompt::Completion(format!(
			"{SYSTEM_TURN_PREFIX}{INSTRUCTIONS}\n\n{USER_TURN_PREFIX}{user_text}\n\n{OUTPUT_DIRECTIVE}"
		)),
		BackendMode::Remote => Prompt::Chat {
			system: format!("{INSTRUCTIONS}\n\n{OUTPUT_DIRECTIVE}"),
			user: user_text.to_string(),
		},
	}
}
