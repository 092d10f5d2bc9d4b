//! Probe binary for verifying the configured chat backend
//! This is a utility binary, not part of the main application

use anyhow::Context;
use dialogue_bridge::config::Config;
use dialogue_bridge::llm::{build_backend, ChatMessage, ChatRequest, ChatRole};
use futures_util::StreamExt;
use std::io::Write;
use tokio::time::{timeout, Duration};

const PROMPT: &str = "What is 2+2? Answer in one sentence.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Probing the configured chat backend...\n");

    // Step 1: Load configuration from the environment
    println!("1. Loading configuration...");
    let config = Config::from_env().context("Failed to load configuration")?;
    println!("   ✓ Provider: {}", config.llm.provider);
    println!("   ✓ Model: {}", config.llm.model);
    println!("   ✓ Base URL: {}", config.llm.base_url);
    match &config.llm.api_key {
        Some(key) => println!("   ✓ API key is set (length: {} chars)", key.len()),
        None => eprintln!("   ⚠ No API key configured (OPENAI_API_KEY)"),
    }

    // Step 2: Build the backend
    println!("\n2. Building backend...");
    let backend = build_backend(&config.llm).context("Failed to build backend")?;
    println!("   ✓ Backend: {}", backend.name());

    let request = ChatRequest {
        model: config.llm.model.clone(),
        messages: vec![
            ChatMessage::new(ChatRole::System, config.dialogue.system_prompt.clone()),
            ChatMessage::new(ChatRole::User, PROMPT),
        ],
        temperature: config.llm.temperature,
        max_tokens: config.llm.max_tokens,
    };
    let limit = Duration::from_secs(config.llm.read_timeout_secs + 5);

    // Step 3: Single-shot request
    println!("\n3. Sending single-shot request...");
    println!("   Query: '{}'", PROMPT);
    match timeout(limit, backend.chat(&request)).await {
        Ok(Ok(reply)) => {
            println!("   ✓ Response received:");
            println!("   {}", reply.trim());
        }
        Ok(Err(e)) => {
            eprintln!("   ✗ Request failed: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            eprintln!("   ✗ Request timed out after {:?}", limit);
            anyhow::bail!("single-shot request timed out");
        }
    }

    // Step 4: Streamed request
    println!("\n4. Sending streamed request...");
    let streamed = async {
        let mut stream = backend.chat_stream(&request).await?;
        let mut fragments = 0usize;
        print!("   ");
        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            fragments += 1;
            print!("{}", fragment);
            let _ = std::io::stdout().flush();
        }
        println!();
        Ok::<usize, dialogue_bridge::llm::BackendError>(fragments)
    };
    match timeout(limit, streamed).await {
        Ok(Ok(fragments)) => println!("   ✓ Stream finished after {} fragments", fragments),
        Ok(Err(e)) => {
            eprintln!("   ✗ Stream failed: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            eprintln!("   ✗ Stream timed out after {:?}", limit);
            anyhow::bail!("streamed request timed out");
        }
    }

    println!("\n✓ Backend probe complete");
    Ok(())
}
