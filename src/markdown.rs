use std::sync::LazyLock;

use regex::Regex;

struct Rule {
    re: Regex,
    replace: &'static str,
}

fn rule(pattern: &str, replace: &'static str) -> Rule {
    Rule {
        re: Regex::new(pattern).expect("valid regex"),
        replace,
    }
}

const YOUTUBE: &str = "\nhttps://www.youtube.com/watch?v=";

// Passes before entity decoding.
static RAW_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // <!-- s:) --><img src="{SMILIES_PATH}/icon_e_smile.gif" alt=":)" title="Smile" /><!-- s:) -->
        rule(r"<!-- s(\S+) --><img (?:[^>]+) /><!-- s(?:\S+) -->", "${1}"),
        // <!-- m --><a class="postlink" href="http://x.com">http://x.com</a><!-- m -->
        rule(
            r#"<!-- \w --><a(?:.+)href="(\S+)"(?:.*)>(.+)</a><!-- \w -->"#,
            "[${2}](${1})",
        ),
        // [url=https&#58;//google&#46;com:1qh1i7ky]click[/url:1qh1i7ky]
        rule(r":[0-9A-Za-z_]{8}\]", "]"),
        rule(r"(?m)(^\[video=.*?\])|(\[/video\]$)", ""),
    ]
});

static BBCODE_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // phpBB shortens long link texts to "[http://host/path ... tail](url)".
        rule(r"\[http(s)?://(www\.)?", "["),
        rule(r"(?is)(\[/?quote.*?\])", "\n${1}\n"),
        rule(r#"(?i)\[quote="?(.*?)"?\]"#, "\n[quote=\"${1}\"]\n"),
        rule(r"(?i)\[size=large\](.+)\[/size\]", "<big>${1}</big>"),
        rule(r"(?i)\[size=x.large\](.+)\[/size\]", "<big>${1}</big>"),
        rule(r"(?i)\[size=medium\](.+)\[/size\]", "${1}"),
        rule(r"(?i)\[size=small\](.+)\[/size\]", "<small>${1}</small>"),
        rule(r"(?i)\[size=x.small\](.+)\[/size\]", "<small>${1}</small>"),
        rule(
            r"(?i)\[spoiler=(.+?)\](.+)\[/spoiler\]",
            "[details=${1}](${2})[/details]",
        ),
        rule(r"(?i)\[spoiler\](.+)\[/spoiler\]", "[details](${1})[/details]"),
        rule(r#"(?i)\[url="?(.+?)"?\](.+)\[/url\]"#, "[${2}](${1})"),
        rule(r"(?s)\[list\](.*?)\[/list\]", "[ul]${1}[/ul]"),
        rule(r"(?s)\[list=1\](.*?)\[/list\]", "[ol]${1}[/ol]"),
        rule(r"\[\*\](.*?)\n", "[li]${1}[/li]"),
        rule(r"(?i)\[/?code\]", "\n```\n"),
        rule(r"(?i)\[/?highlight\]", "\n```\n"),
    ]
});

static EMBED_RULES: LazyLock<Vec<(Regex, usize)>> = LazyLock::new(|| {
    [
        (r"(?i)\[youtube\](.+?)\[/youtube\]", 1),
        (r#"(?i)\[youtube="?(.+?)"?\](.+)\[/youtube\]"#, 2),
        (r"(?i)\[MEDIA=youtube\](.+?)\[/MEDIA\]", 1),
    ]
    .into_iter()
    .map(|(pattern, group)| (Regex::new(pattern).expect("valid regex"), group))
    .collect()
});

static TAIL_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(r#"(?i)\[ame="?(.+?)"?\](.+)\[/ame\]"#, "\n${1}\n"),
        rule(
            r"(?i)\[video=youtube;([^\]]+)\].*?\[/video\]",
            "\nhttps://www.youtube.com/watch?v=${1}\n",
        ),
        rule(r#"(?i)\[user="?(.+?)"?\](.+)\[/user\]"#, "${2}"),
        rule(r"(?i)\[color=[#a-z0-9]+\]", ""),
        rule(r"(?i)\[/color\]", ""),
        rule(r"(?i)\[hr\]", "<hr>"),
    ]
});

fn apply(rules: &[Rule], mut out: String) -> String {
    for r in rules {
        out = r.re.replace_all(&out, r.replace).into_owned();
    }
    out
}

/// Rewrites Phorum/phpBB/MyBB markup into the Markdown dialect of the forum.
///
/// Rules run in a fixed order and each one sees the output of the previous
/// ones. Markup no rule recognises is left untouched.
pub fn phorum_to_markdown(raw: &str, import_id: &str) -> String {
    let mut out = apply(&RAW_RULES, raw.to_string());
    out = html_escape::decode_html_entities(&out).into_owned();
    out = apply(&BBCODE_RULES, out);

    for (re, group) in EMBED_RULES.iter() {
        out = re
            .replace_all(&out, |caps: &regex::Captures| {
                format!("{YOUTUBE}{}\n", &caps[*group])
            })
            .into_owned();
    }

    out = apply(&TAIL_RULES, out);

    if out.ends_with("<br>") {
        out.truncate(out.len() - "<br>".len());
    }

    log::trace!("normalized post {import_id} ({} bytes)", out.len());
    out
}
