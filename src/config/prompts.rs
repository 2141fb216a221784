//! System prompts for the decision oracle.

use chrono::{Datelike, Local};

use crate::actions::CoordinateSystem;

fn coordinate_note_en(coordinates: CoordinateSystem, width: u32, height: u32) -> String {
    match coordinates {
        CoordinateSystem::Absolute => format!(
            "Coordinates are absolute pixel coordinates: x in [0, {}), y in [0, {}).",
            width, height
        ),
        CoordinateSystem::Relative => {
            "Coordinates are relative: x and y both in [0, 1000], where (0,0) is the top-left \
             corner and (1000,1000) is the bottom-right corner."
                .to_string()
        }
    }
}

fn coordinate_note_zh(coordinates: CoordinateSystem, width: u32, height: u32) -> String {
    match coordinates {
        CoordinateSystem::Absolute => format!(
            "坐标为绝对像素坐标: x 取值 [0, {}), y 取值 [0, {})。",
            width, height
        ),
        CoordinateSystem::Relative => {
            "坐标为相对坐标: x 和 y 的取值范围均为 [0, 1000], 左上角为 (0,0), 右下角为 (1000,1000)。"
                .to_string()
        }
    }
}

/// Get the English system prompt for a screen.
pub fn get_system_prompt_en(coordinates: CoordinateSystem, width: u32, height: u32) -> String {
    let today = Local::now();
    format!(
        "Today's date is: {}\nCurrent screen resolution: {}x{} (width x height)\n{}\n{}",
        today.format("%B %d, %Y"),
        width,
        height,
        coordinate_note_en(coordinates, width, height),
        SYSTEM_PROMPT_EN
    )
}

/// Get the Chinese system prompt for a screen.
pub fn get_system_prompt_zh(coordinates: CoordinateSystem, width: u32, height: u32) -> String {
    let today = Local::now();
    let weekday_names = [
        "星期一",
        "星期二",
        "星期三",
        "星期四",
        "星期五",
        "星期六",
        "星期日",
    ];
    let weekday = weekday_names[today.weekday().num_days_from_monday() as usize];
    format!(
        "今天的日期是: {} {}\n当前屏幕分辨率: {}x{} (宽x高)\n{}\n{}",
        today.format("%Y年%m月%d日"),
        weekday,
        width,
        height,
        coordinate_note_zh(coordinates, width, height),
        SYSTEM_PROMPT_ZH
    )
}

/// Get the system prompt by language.
pub fn get_system_prompt(
    lang: &str,
    coordinates: CoordinateSystem,
    width: u32,
    height: u32,
) -> String {
    match lang {
        "zh" | "cn" => get_system_prompt_zh(coordinates, width, height),
        _ => get_system_prompt_en(coordinates, width, height),
    }
}

pub const SYSTEM_PROMPT_EN: &str = r#"You are an agent that operates an Android phone to complete the user's goal.
Each turn you receive the goal, feedback about your previous action, a diff of the screen, warnings, and the list of visible UI elements (text, id, bounds, flags). Sometimes a screenshot is attached.

Reply with exactly ONE JSON object and nothing else:
{"action": "<name>", ...parameters..., "reasoning": "<why>", "plan": "<optional next steps>"}

Available actions:
- {"action": "tap", "x": X, "y": Y}
- {"action": "double_tap", "x": X, "y": Y}
- {"action": "long_press", "x": X, "y": Y, "duration_ms": 800}
- {"action": "swipe", "x1": X, "y1": Y, "x2": X, "y2": Y, "duration_ms": 300}
- {"action": "scroll", "direction": "up" | "down" | "left" | "right"}
- {"action": "type", "text": "..."}   types into the focused field
- {"action": "clear_text"}
- {"action": "enter"}
- {"action": "back"}
- {"action": "home"}
- {"action": "recents"}
- {"action": "launch", "app": "WhatsApp"}   app name or package name
- {"action": "open_url", "url": "https://..."}
- {"action": "open_notifications"}
- {"action": "key_event", "code": 66}
- {"action": "clipboard_set", "text": "..."}
- {"action": "clipboard_get"}
- {"action": "paste"}
- {"action": "wait", "seconds": 2}
- {"action": "request_screenshot"}   attach a screenshot to the next observation
- {"action": "find_and_tap", "query": "Settings"}   finds an element by text (scrolling if needed) and taps it
- {"action": "read_screen", "max_scrolls": 5}   scrolls and copies all visible text to the clipboard
- {"action": "submit_message"}   taps the Send/Submit control of the current compose box
- {"action": "wait_for_content", "timeout_secs": 10}   waits until new text appears
- {"action": "done", "message": "..."}   the goal is complete

Rules:
1. Prefer find_and_tap over raw coordinates when the target has visible text.
2. Read the feedback and the screen diff before acting. If the screen did not change, your last action did not work: try a different element, a different action, or a side channel such as typing or the clipboard.
3. Never repeat an action that a warning tells you not to repeat.
4. Do not keep scrolling or going back. After a few navigation actions, interact with something concrete.
5. If an app is not open, launch it instead of searching the home screen.
6. Before done, check that the goal is actually complete.
"#;

pub const SYSTEM_PROMPT_ZH: &str = r#"你是一个操作安卓手机以完成用户目标的智能体。
每一轮你会收到: 目标、上一步操作的反馈、屏幕变化摘要、警告信息以及当前可见的界面元素列表 (文本、id、边界、状态)。有时会附带截图。

只回复一个 JSON 对象, 不要输出其他内容:
{"action": "<名称>", ...参数..., "reasoning": "<原因>", "plan": "<可选的后续计划>"}

可用操作:
- {"action": "tap", "x": X, "y": Y}
- {"action": "double_tap", "x": X, "y": Y}
- {"action": "long_press", "x": X, "y": Y, "duration_ms": 800}
- {"action": "swipe", "x1": X, "y1": Y, "x2": X, "y2": Y, "duration_ms": 300}
- {"action": "scroll", "direction": "up" | "down" | "left" | "right"}
- {"action": "type", "text": "..."}   在当前焦点输入框中输入文本
- {"action": "clear_text"}
- {"action": "enter"}
- {"action": "back"}
- {"action": "home"}
- {"action": "recents"}
- {"action": "launch", "app": "微信"}   应用名或包名
- {"action": "open_url", "url": "https://..."}
- {"action": "open_notifications"}
- {"action": "key_event", "code": 66}
- {"action": "clipboard_set", "text": "..."}
- {"action": "clipboard_get"}
- {"action": "paste"}
- {"action": "wait", "seconds": 2}
- {"action": "request_screenshot"}   下一次观察时附带截图
- {"action": "find_and_tap", "query": "设置"}   按文本查找元素 (必要时滚动) 并点击
- {"action": "read_screen", "max_scrolls": 5}   滚动并把所有文本复制到剪贴板
- {"action": "submit_message"}   点击当前输入框的发送/提交按钮
- {"action": "wait_for_content", "timeout_secs": 10}   等待新内容出现
- {"action": "done", "message": "..."}   任务已完成

规则:
1. 目标有可见文本时, 优先使用 find_and_tap 而不是坐标。
2. 操作前先阅读反馈和屏幕变化。如果屏幕没有变化, 说明上一步无效: 换一个元素、换一种操作, 或改用输入文本、剪贴板等方式。
3. 警告中禁止重复的操作不要再重复。
4. 不要一直滚动或返回。几次导航之后必须与具体元素交互。
5. 如果应用未打开, 直接 launch 启动, 不要在桌面上寻找。
6. 执行 done 之前确认目标确实已完成。
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_system_prompt() {
        let en = get_system_prompt("en", CoordinateSystem::Absolute, 1080, 1920);
        assert!(en.contains("Today's date is"));
        assert!(en.contains("Current screen resolution: 1080x1920"));
        assert!(en.contains("x in [0, 1080)"));
        assert!(en.contains("find_and_tap"));

        let zh = get_system_prompt("zh", CoordinateSystem::Relative, 1080, 1920);
        assert!(zh.contains("今天的日期是"));
        assert!(zh.contains("[0, 1000]"));
    }

    #[test]
    fn test_prompt_lists_every_action() {
        for kind in crate::actions::Action::KINDS {
            assert!(
                SYSTEM_PROMPT_EN.contains(&format!("\"action\": \"{}\"", kind)),
                "missing {}",
                kind
            );
        }
    }
}
