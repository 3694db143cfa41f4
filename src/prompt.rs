pub const SYSTEM_INSTRUCTION: &str = "You are an expert document writer.
1. Output your answer using HTML tags only (<h1>, <p>, <b>, <ul>, etc.).
2. Do NOT use markdown.
3. Use the user's uploaded file content to write the document.";

/// Labeled block for one extracted document.
pub fn document_block(filename: &str, text: &str) -> String {
    format!("\n--- Content of {} ---\n{}\n", filename, text)
}

/// Instruction, user prompt, then every document block in upload order.
pub fn assemble(prompt: &str, blocks: &[String]) -> String {
    let mut out = format!(
        "{}\n\nUser Prompt: {}\n\nUploaded Document Content:",
        SYSTEM_INSTRUCTION, prompt
    );
    for block in blocks {
        out.push_str(block);
    }
    out
}
