//! SCPD (service description) parsing and the action schema built from it.
//!
//! A renderer advertises, per service, the set of actions it accepts and
//! the state variables those actions read and write. We keep both so that
//! argument XML can carry the datatype annotation the device expects, and
//! so that enumerated values (play speeds, seek units, ...) are sent
//! exactly as the device spells them.

use std::io::BufRead;

use quick_xml::{events::Event, Reader};
use thiserror::Error;
use xmltree::Element;

use crate::soap::{build_action_request, text_element};

#[derive(Debug, Error)]
pub enum ScpdError {
    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentDirection {
    In,
    Out,
}

#[derive(Debug, Clone)]
pub struct ActionArgument {
    pub name: String,
    pub direction: ArgumentDirection,
    pub related_state_variable: String,
}

#[derive(Debug, Clone)]
pub struct ServiceAction {
    pub name: String,
    pub arguments: Vec<ActionArgument>,
}

impl ServiceAction {
    /// Arguments sent with the request, in declaration order.
    pub fn inputs(&self) -> impl Iterator<Item = &ActionArgument> {
        self.arguments
            .iter()
            .filter(|a| a.direction == ArgumentDirection::In)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateVariable {
    pub name: String,
    pub data_type: String,
    pub allowed_values: Vec<String>,
    /// min/max/step kept as strings: devices put non-integer values here.
    pub range_min: Option<String>,
    pub range_max: Option<String>,
    pub range_step: Option<String>,
}

/// The parsed schema of one service.
#[derive(Debug, Clone, Default)]
pub struct ServiceSchema {
    pub actions: Vec<ServiceAction>,
    pub state_variables: Vec<StateVariable>,
}

impl ServiceSchema {
    pub fn action(&self, name: &str) -> Option<&ServiceAction> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.action(name).is_some()
    }

    pub fn state_variable(&self, name: &str) -> Option<&StateVariable> {
        self.state_variables.iter().find(|v| v.name == name)
    }

    /// Build the XML element for one input argument.
    ///
    /// - If the related state variable enumerates allowed values and
    ///   `command_param` matches one case-insensitively, that enumerated
    ///   spelling is sent.
    /// - Otherwise, if values are enumerated, the first one is sent.
    /// - Otherwise `value` is sent verbatim.
    ///
    /// Known variables get the legacy Microsoft datatype annotation many
    /// renderers require; an unknown variable yields a bare element.
    pub fn build_argument(
        &self,
        arg: &ActionArgument,
        value: &str,
        command_param: Option<&str>,
    ) -> Element {
        let Some(var) = self.state_variable(&arg.related_state_variable) else {
            return text_element(&arg.name, value);
        };

        let resolved = if !var.allowed_values.is_empty() {
            command_param
                .and_then(|wanted| {
                    var.allowed_values
                        .iter()
                        .find(|v| v.eq_ignore_ascii_case(wanted))
                })
                .unwrap_or(&var.allowed_values[0])
                .clone()
        } else {
            value.to_string()
        };

        let mut elem = text_element(&arg.name, &resolved);
        elem.attributes.insert(
            "xmlns:dt".to_string(),
            "urn:schemas-microsoft-com:datatypes".to_string(),
        );
        elem.attributes
            .insert("dt:dt".to_string(), var.data_type.clone());
        elem
    }

    /// Build the full SOAP request body for `action`.
    ///
    /// `values` supplies input arguments by name; `InstanceID` is always
    /// "0" and out-direction arguments are never sent.
    pub fn build_action_body(
        &self,
        service_type: &str,
        action: &ServiceAction,
        values: &[(&str, String)],
        command_param: Option<&str>,
    ) -> Result<String, xmltree::Error> {
        let mut elems = Vec::new();
        for arg in action.inputs() {
            if arg.name == "InstanceID" {
                elems.push(text_element("InstanceID", "0"));
                continue;
            }
            let value = values
                .iter()
                .find(|(name, _)| *name == arg.name)
                .map(|(_, v)| v.as_str())
                .unwrap_or("");
            elems.push(self.build_argument(arg, value, command_param));
        }
        build_action_request(service_type, &action.name, elems)
    }
}

/// Parse an SCPD document into a [`ServiceSchema`].
pub fn parse_scpd<R: BufRead>(input: R) -> Result<ServiceSchema, ScpdError> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut schema = ServiceSchema::default();

    let mut current_tag: Option<String> = None;
    let mut current_action: Option<ServiceAction> = None;
    let mut current_argument: Option<ActionArgument> = None;
    let mut current_variable: Option<StateVariable> = None;
    let mut in_range = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "action" => {
                        current_action = Some(ServiceAction {
                            name: String::new(),
                            arguments: Vec::new(),
                        });
                    }
                    "argument" => {
                        current_argument = Some(ActionArgument {
                            name: String::new(),
                            direction: ArgumentDirection::In,
                            related_state_variable: String::new(),
                        });
                    }
                    "stateVariable" => {
                        current_variable = Some(StateVariable::default());
                    }
                    "allowedValueRange" => {
                        in_range = true;
                    }
                    _ => {}
                }
                current_tag = Some(name);
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "action" => {
                        if let Some(action) = current_action.take() {
                            if !action.name.is_empty() {
                                schema.actions.push(action);
                            }
                        }
                    }
                    "argument" => {
                        if let (Some(action), Some(arg)) =
                            (current_action.as_mut(), current_argument.take())
                        {
                            action.arguments.push(arg);
                        }
                    }
                    "stateVariable" => {
                        if let Some(var) = current_variable.take() {
                            if !var.name.is_empty() {
                                schema.state_variables.push(var);
                            }
                        }
                    }
                    "allowedValueRange" => {
                        in_range = false;
                    }
                    _ => {}
                }
                current_tag = None;
            }
            Event::Text(e) => {
                let Some(tag) = &current_tag else {
                    buf.clear();
                    continue;
                };
                let text = e.unescape()?.into_owned();

                if let Some(arg) = current_argument.as_mut() {
                    match tag.as_str() {
                        "name" => arg.name = text,
                        "direction" => {
                            arg.direction = if text.eq_ignore_ascii_case("out") {
                                ArgumentDirection::Out
                            } else {
                                ArgumentDirection::In
                            };
                        }
                        "relatedStateVariable" => arg.related_state_variable = text,
                        _ => {}
                    }
                } else if let Some(var) = current_variable.as_mut() {
                    match tag.as_str() {
                        "name" => var.name = text,
                        "dataType" => var.data_type = text,
                        "allowedValue" => var.allowed_values.push(text),
                        "minimum" if in_range => var.range_min = Some(text),
                        "maximum" if in_range => var.range_max = Some(text),
                        "step" if in_range => var.range_step = Some(text),
                        _ => {}
                    }
                } else if let Some(action) = current_action.as_mut() {
                    if tag.as_str() == "name" {
                        action.name = text;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERING_CONTROL_SCPD: &str = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <actionList>
    <action>
      <name>SetVolume</name>
      <argumentList>
        <argument>
          <name>InstanceID</name>
          <direction>in</direction>
          <relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable>
        </argument>
        <argument>
          <name>Channel</name>
          <direction>in</direction>
          <relatedStateVariable>A_ARG_TYPE_Channel</relatedStateVariable>
        </argument>
        <argument>
          <name>DesiredVolume</name>
          <direction>in</direction>
          <relatedStateVariable>Volume</relatedStateVariable>
        </argument>
      </argumentList>
    </action>
    <action>
      <name>GetVolume</name>
      <argumentList>
        <argument>
          <name>InstanceID</name>
          <direction>in</direction>
          <relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable>
        </argument>
        <argument>
          <name>Channel</name>
          <direction>in</direction>
          <relatedStateVariable>A_ARG_TYPE_Channel</relatedStateVariable>
        </argument>
        <argument>
          <name>CurrentVolume</name>
          <direction>out</direction>
          <relatedStateVariable>Volume</relatedStateVariable>
        </argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable sendEvents="no">
      <name>Volume</name>
      <dataType>ui2</dataType>
      <allowedValueRange>
        <minimum>0</minimum>
        <maximum>40</maximum>
        <step>1</step>
      </allowedValueRange>
    </stateVariable>
    <stateVariable sendEvents="no">
      <name>A_ARG_TYPE_Channel</name>
      <dataType>string</dataType>
      <allowedValueList>
        <allowedValue>Master</allowedValue>
        <allowedValue>LF</allowedValue>
      </allowedValueList>
    </stateVariable>
    <stateVariable sendEvents="no">
      <name>A_ARG_TYPE_InstanceID</name>
      <dataType>ui4</dataType>
    </stateVariable>
  </serviceStateTable>
</scpd>"#;

    fn schema() -> ServiceSchema {
        parse_scpd(RENDERING_CONTROL_SCPD.as_bytes()).unwrap()
    }

    #[test]
    fn parses_actions_with_ordered_arguments() {
        let schema = schema();
        assert_eq!(schema.actions.len(), 2);

        let set_volume = schema.action("SetVolume").unwrap();
        let names: Vec<&str> = set_volume.arguments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["InstanceID", "Channel", "DesiredVolume"]);
        assert!(set_volume
            .arguments
            .iter()
            .all(|a| a.direction == ArgumentDirection::In));

        let get_volume = schema.action("GetVolume").unwrap();
        assert_eq!(
            get_volume.arguments.last().unwrap().direction,
            ArgumentDirection::Out
        );
        assert_eq!(get_volume.inputs().count(), 2);
    }

    #[test]
    fn parses_state_variables_with_range_and_list() {
        let schema = schema();
        let volume = schema.state_variable("Volume").unwrap();
        assert_eq!(volume.data_type, "ui2");
        assert_eq!(volume.range_min.as_deref(), Some("0"));
        assert_eq!(volume.range_max.as_deref(), Some("40"));

        let channel = schema.state_variable("A_ARG_TYPE_Channel").unwrap();
        assert_eq!(channel.allowed_values, ["Master", "LF"]);
    }

    #[test]
    fn argument_gets_datatype_annotation() {
        let schema = schema();
        let action = schema.action("SetVolume").unwrap();
        let arg = action.arguments.iter().find(|a| a.name == "DesiredVolume").unwrap();
        let elem = schema.build_argument(arg, "17", None);
        assert_eq!(elem.attributes.get("dt:dt").map(String::as_str), Some("ui2"));
        assert_eq!(elem.get_text().as_deref(), Some("17"));
    }

    #[test]
    fn enumerated_argument_resolves_command_param_case_insensitively() {
        let schema = schema();
        let action = schema.action("SetVolume").unwrap();
        let arg = action.arguments.iter().find(|a| a.name == "Channel").unwrap();

        let elem = schema.build_argument(arg, "ignored", Some("master"));
        assert_eq!(elem.get_text().as_deref(), Some("Master"));

        // No match: first allowed value.
        let elem = schema.build_argument(arg, "ignored", Some("Surround"));
        assert_eq!(elem.get_text().as_deref(), Some("Master"));

        // No parameter at all: first allowed value.
        let elem = schema.build_argument(arg, "ignored", None);
        assert_eq!(elem.get_text().as_deref(), Some("Master"));
    }

    #[test]
    fn unknown_state_variable_yields_untyped_element() {
        let schema = schema();
        let arg = ActionArgument {
            name: "Mystery".to_string(),
            direction: ArgumentDirection::In,
            related_state_variable: "NoSuchVariable".to_string(),
        };
        let elem = schema.build_argument(&arg, "abc", None);
        assert!(elem.attributes.is_empty());
        assert_eq!(elem.get_text().as_deref(), Some("abc"));
    }

    #[test]
    fn action_body_fixes_instance_id_and_skips_out_args() {
        let schema = schema();
        let action = schema.action("GetVolume").unwrap();
        let body = schema
            .build_action_body(
                "urn:schemas-upnp-org:service:RenderingControl:1",
                action,
                &[],
                Some("Master"),
            )
            .unwrap();
        assert!(body.contains("<InstanceID>0</InstanceID>"));
        assert!(body.contains("Master"));
        assert!(!body.contains("CurrentVolume"));
    }
}
