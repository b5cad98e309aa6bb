// Workflow commands embedded in step output: `::command key=val::data`.
// Steps use these to publish outputs, grow the mask set, and annotate logs.

/// A workflow command recognized by the step sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowCommand {
    SetOutput { name: String, value: String },
    AddMask { value: String },
    Error { message: String },
    Warning { message: String },
    Notice { message: String },
    Debug { message: String },
    Group { title: String },
    EndGroup,
}

const COMMAND_KEY: &str = "::";

fn unescape_data(data: &str) -> String {
    data.replace("%0D", "\r")
        .replace("%0A", "\n")
        .replace("%25", "%")
}

fn unescape_property(value: &str) -> String {
    value
        .replace("%0D", "\r")
        .replace("%0A", "\n")
        .replace("%3A", ":")
        .replace("%2C", ",")
        .replace("%25", "%")
}

/// Try to parse one output line as a workflow command.
///
/// Returns `None` for ordinary output and for command names this core does
/// not recognize.
pub fn parse(line: &str) -> Option<WorkflowCommand> {
    let line = line.trim_start();
    let after_prefix = line.strip_prefix(COMMAND_KEY)?;
    let end = after_prefix.find(COMMAND_KEY)?;
    let info = &after_prefix[..end];
    let data = unescape_data(&after_prefix[end + COMMAND_KEY.len()..]);

    let (command, properties_str) = match info.find(' ') {
        Some(space) => (&info[..space], info[space + 1..].trim()),
        None => (info, ""),
    };

    let mut properties = Vec::new();
    for entry in properties_str.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((key, value)) = entry.split_once('=') {
            if !key.is_empty() {
                properties.push((key.to_string(), unescape_property(value)));
            }
        }
    }
    let property = |name: &str| {
        properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    };

    match command {
        "set-output" => Some(WorkflowCommand::SetOutput {
            name: property("name")?,
            value: data,
        }),
        "add-mask" => Some(WorkflowCommand::AddMask { value: data }),
        "error" => Some(WorkflowCommand::Error { message: data }),
        "warning" => Some(WorkflowCommand::Warning { message: data }),
        "notice" => Some(WorkflowCommand::Notice { message: data }),
        "debug" => Some(WorkflowCommand::Debug { message: data }),
        "group" => Some(WorkflowCommand::Group { title: data }),
        "endgroup" => Some(WorkflowCommand::EndGroup),
        _ => None,
    }
}
