/// 平均每个 token 对应的字符数（粗略经验值）。
const CHARS_PER_TOKEN: usize = 4;

/// 粗略估算一组文本片段的 token 数，用于调用前的配额预留。
///
/// 非空片段以空格拼接后按字符数估算；没有任何文本时返回 0，否则至少为 1。
pub fn estimate_tokens(segments: &[Option<&str>]) -> u64 {
    let parts: Vec<&str> = segments
        .iter()
        .flatten()
        .copied()
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        return 0;
    }

    let chars: usize = parts.iter().map(|s| s.chars().count()).sum::<usize>() + parts.len() - 1;
    (chars / CHARS_PER_TOKEN).max(1) as u64
}
