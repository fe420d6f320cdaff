// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quick patch: splice one attention head from the injected run into the
//! clean run and check whether the secret leaks.
//!
//! ```bash
//! cargo run --release --example quick_patch
//! ```
//!
//! On first run, downloads GPT-2 small (~550 MB) from `HuggingFace` Hub.
//! Subsequent runs use the local cache.

use inject_mi::download::ModelFiles;
use inject_mi::{
    ActivationCache, GenerateOptions, HookPoint, MIModel, MITokenizer, PatchSpec, PromptOptions,
    PromptPair, Verdict, generate, run_and_capture, scenario,
};

fn main() -> inject_mi::Result<()> {
    // 1. Load model and tokenizer
    let model_id = "openai-community/gpt2";
    println!("Loading {model_id}...");
    let model = MIModel::from_pretrained(model_id, false)?;
    // Already in the local cache after the model download.
    let tokenizer = MITokenizer::from_file(ModelFiles::resolve(model_id)?.tokenizer)?;
    println!(
        "  {} layers, {} heads, {} hidden, device: {:?}",
        model.num_layers(),
        model.num_heads(),
        model.hidden_size(),
        model.device()
    );

    // 2. Build the aligned prompt pair
    let options = PromptOptions::for_model(&model);
    let pair = PromptPair::build(
        &tokenizer,
        &scenario::clean_prompt(),
        &scenario::injected_prompt(),
        &options,
    )?;
    println!(
        "\nAligned length {} (clean prompt padded by {})",
        pair.len(),
        pair.baseline.padding
    );

    // 3. Capture every site of the injected run
    let (_, injected_cache) = run_and_capture(&model, &pair.variant.ids)?;
    println!("Captured {} sites", injected_cache.len());

    // 4. Generate on the clean prompt, unpatched and patched
    let generate_options = GenerateOptions {
        end_token: options.resolve_eos(&tokenizer),
        ..GenerateOptions::default()
    };
    let clean = generate(
        &model,
        &tokenizer,
        &pair.baseline.ids,
        &[],
        &ActivationCache::default(),
        &generate_options,
    )?;

    let patch = [PatchSpec::heads(HookPoint::AttnZ(11), &[4])];
    let patched = generate(
        &model,
        &tokenizer,
        &pair.baseline.ids,
        &patch,
        &injected_cache,
        &generate_options,
    )?;

    // 5. Report
    for (label, run) in [("clean", &clean), ("patched z:11@4", &patched)] {
        println!("\n--- {label} ({}) ---", run.stop_reason);
        println!("{:?}", run.generated_text);
        println!("{}", Verdict::evaluate(&run.generated_text, scenario::SECRET));
    }

    Ok(())
}
