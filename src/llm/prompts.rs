//! System prompts and prompt templates

/// Markup conventions the scene model is asked to follow
pub const SCENE_STYLE_GUIDELINE: &str = r#"Syntax guideline
- Be hierarchical and efficient. Add details when the user asks for them.
- Avoid deep nesting. Prefer simple, obvious tag names.
- Use arbitrary tags and attributes. Prefer tags over attributes.
  - Use tags for subjects, objects, environments and entities.
  - Use attributes for un-materialized properties of a tag, such as style, material or lighting.
- Use concise natural language where a description is needed.
- Describe spatial relationships explicitly."#;

/// Default dialogue requirement when the user gives none
pub const DEFAULT_DIALOGUE_REQUIREMENT: &str = "related to the world model";

/// System prompt for scene description ahead of image generation
pub const IMAGE_DESCRIPTION_PROMPT: &str = r#"Convert the provided scene XML into a single paragraph of natural language description. Requirements:
- Be thorough. Every tag, attribute and inner text must be incorporated.
- Do not imagine or infer unmentioned details.
- Be concise. Do NOT add narrative or emotional description."#;

/// Build the scene-editing system prompt around the current scene markup
pub fn scene_system_prompt(scene_xml: &str, root_tag: &str) -> String {
    format!(
        r#"You are a 3D model technical artist. The current scene looks like this:

```xml
{scene_xml}
```

{SCENE_STYLE_GUIDELINE}

Now update the scene XML based on the user's instructions. You must use one of the following tools:
- patch_scene: pass a list of DOM operations that edit the current scene in place.
- rewrite_xml: rewrite the entire scene XML. The top level tag must be <{root_tag}>.

Use exactly one tool. Do NOT say anything after tool use."#
    )
}

/// Build the dialogue system prompt
///
/// An empty or blank requirement falls back to [`DEFAULT_DIALOGUE_REQUIREMENT`].
pub fn dialogue_system_prompt(requirement: &str) -> String {
    let requirement = match requirement.trim() {
        "" => DEFAULT_DIALOGUE_REQUIREMENT,
        other => other,
    };

    format!(
        r#"Simulate a dialogue based on the world model provided by the user.

The dialogue must involve exactly two participants. Their concrete personas depend on the requirement, but their abstract roles must be:
- Participant 1 is the expert: knowledgeable about the world model, confident, gives authoritative answers and listens well.
- Participant 2 is the novice: curious, takes the initiative to ask questions and is eager to learn.

The dialogue must meet this requirement: {requirement}

Respond in this JSON format:
{{
  "utterances": {{
    "speaker": "expert" | "novice";
    "utterance": string;
  }}[]
}}"#
    )
}

/// Build the dialogue user message around the world markup
pub fn dialogue_user_prompt(world_xml: &str) -> String {
    format!(
        "{world_xml}\n\nNow respond with the FULL dialogue. Do NOT stop until the entire dialogue is complete."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_prompt_embeds_scene() {
        let prompt = scene_system_prompt("<scene><cube/></scene>", "scene");
        assert!(prompt.contains("<scene><cube/></scene>"));
        assert!(prompt.contains("patch_scene"));
        assert!(prompt.contains("rewrite_xml"));
        assert!(prompt.contains("exactly one tool"));
    }

    #[test]
    fn test_dialogue_prompt_default_requirement() {
        let prompt = dialogue_system_prompt("  ");
        assert!(prompt.contains(DEFAULT_DIALOGUE_REQUIREMENT));

        let prompt = dialogue_system_prompt("about lighting");
        assert!(prompt.contains("requirement: about lighting"));
        assert!(prompt.contains("\"utterances\""));
    }

    #[test]
    fn test_dialogue_user_prompt() {
        let prompt = dialogue_user_prompt("<scene/>");
        assert!(prompt.starts_with("<scene/>"));
        assert!(prompt.contains("FULL dialogue"));
    }
}
