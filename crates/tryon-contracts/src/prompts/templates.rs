use crate::features::{GenerationOptions, PlacementMode, DEFAULT_BACKGROUND, DEFAULT_HAIR_STYLE};

use super::PromptPlan;

pub(super) fn virtual_try_on(options: &GenerationOptions, has_reference: bool) -> PromptPlan {
    let build = options.body_build();
    let angle = options.angle.portrait_phrase();
    let mut plan = PromptPlan::default();

    plan.override_directive = Some(match options.color_override.as_ref() {
        Some(color) => format!(
            "Absolute priority: recolor the main fabric of the outfit to the exact hex color {color}. \
             This overrides the outfit's original colors; keep realistic fabric texture, shadows and highlights, \
             and leave secondary details such as buttons and zippers in their own colors."
        ),
        None => body_build_rule(build),
    });

    plan.task = if has_reference {
        "You are a master virtual stylist and photorealistic image editor. The first image is the subject: \
         the person, their pose, their face and the background scene. The second image is the outfit to be worn; \
         treat any plain or white background around it as transparent. Create a single photorealistic image of \
         the subject wearing that outfit."
            .to_string()
    } else {
        format!(
            "You are a master virtual stylist and photorealistic image editor. The image is the subject: \
             the person, their pose, their face and the background scene. Create a single photorealistic \
             {angle} image of this {} build person wearing the outfit described below.",
            build.to_lowercase()
        )
    };

    if options.color_override.is_some() {
        plan.preserve.push(body_build_rule(build));
    }
    plan.preserve.push(
        "Preserve the subject's face, hair, skin tone, body pose and the original background exactly; \
         the result must look like it was taken in the same place and must not change who the person is."
            .to_string(),
    );

    if has_reference {
        plan.styling.push(format!(
            "Fit the outfit from the second image onto the subject's body as a {angle} view, following the \
             contours of their body and pose with natural drape, folds and wrinkles."
        ));
        plan.styling.push(
            "The new outfit must completely replace what the subject is wearing. If both images contain a \
             corresponding item, such as a hat or glasses, replace the subject's item with the new one and leave \
             no part of the original visible."
                .to_string(),
        );
    } else {
        plan.styling.push(format!(
            "Dress the subject in the described outfit as a {angle} view, with realistic fabric behavior and a \
             proper fit for their body type."
        ));
    }
    plan.styling.push(
        "Match the outfit's lighting, shadows and colors to the subject's photo so it casts realistic shadows \
         on the body and the environment."
            .to_string(),
    );

    plan.notes = options
        .custom_prompt()
        .map(|notes| format!("Additional styling: {notes}"));

    plan.avoid = vec![
        "Do not alter the subject's face, facial features, hair or skin tone.".to_string(),
        "Do not change the background, lighting environment or pose.".to_string(),
        format!("Do not produce a body type different from the specified {build} build."),
        "Do not leave any part of the original clothing visible, and do not add accessories that are not in the outfit.".to_string(),
        "Do not add text, logos, watermarks or extra people; output only the composed image.".to_string(),
    ];
    plan
}

pub(super) fn hair_style(options: &GenerationOptions, has_reference: bool) -> PromptPlan {
    let features = options.gender.feature_phrase();
    let mut plan = PromptPlan::default();

    plan.override_directive = options.color_override.as_ref().map(|color| {
        format!(
            "Absolute priority: the new hair must be colored to the exact hex color {color}, with natural \
             variation in tone and shine."
        )
    });

    plan.task = if has_reference {
        "Transform this person's hairstyle to match the style shown in the reference image.".to_string()
    } else {
        let style = options.style_description().unwrap_or(DEFAULT_HAIR_STYLE);
        format!("Give this person a new hairstyle: {style}.")
    };

    plan.preserve.push(
        "Maintain the person's facial features, skin tone, bone structure, clothing and background, changing \
         only the hair and facial hair."
            .to_string(),
    );

    plan.styling.push(format!(
        "The new hairstyle should complement {features} facial features and suit the face shape, with natural \
         textures and colors that look professionally styled."
    ));
    plan.styling.push(
        "Use soft natural lighting that shows the hair's texture, volume and movement.".to_string(),
    );

    plan.notes = options
        .custom_prompt()
        .filter(|notes| Some(*notes) != options.style_description())
        .map(|notes| format!("Additional styling notes: {notes}"));

    plan.avoid = vec![
        "Do not change the person's identity, expression or pose.".to_string(),
        "Do not add text, logos or watermarks.".to_string(),
    ];
    plan
}

pub(super) fn background(options: &GenerationOptions, has_reference: bool) -> PromptPlan {
    let mut plan = PromptPlan::default();

    plan.task = if has_reference {
        "Place this person naturally into the scene shown in the second image.".to_string()
    } else {
        let scene = options.background_description().unwrap_or(DEFAULT_BACKGROUND);
        format!("Place this person naturally in a new environment: {scene}.")
    };

    plan.preserve.push(
        "Keep the person's face, body, pose, clothing and hair exactly as they are; only the surroundings change."
            .to_string(),
    );

    match (options.placement, options.placement_instructions()) {
        (PlacementMode::Manual, Some(instructions)) => plan.styling.push(format!(
            "Position them as follows: {instructions}. Keep perspective and scale correct for that position."
        )),
        _ => plan.styling.push(
            "Position them where they naturally belong in the scene, with realistic perspective and scale."
                .to_string(),
        ),
    }
    plan.styling.push(
        "Match lighting, shadows, reflections and color grading between person and scene so the person appears \
         to belong there, with believable depth of field."
            .to_string(),
    );

    plan.notes = options
        .custom_prompt()
        .filter(|notes| Some(*notes) != options.background_description())
        .map(|notes| format!("Scene details: {notes}"));

    plan.avoid = vec![
        "Do not duplicate the person or add other people.".to_string(),
        "Do not add text, logos or watermarks.".to_string(),
    ];
    plan
}

fn body_build_rule(build: &str) -> String {
    format!(
        "Body type fidelity: the person has a {build} build. Their physique must match this description exactly; \
         do not make them thinner, larger or more athletic, and make the clothing fit and drape on this body type."
    )
}
