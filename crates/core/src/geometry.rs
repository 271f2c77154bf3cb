use serde::{Deserialize, Serialize};

use crate::model::Card;

/// Axis-aligned rectangle in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn of_card(card: &Card) -> Self {
        Self::new(
            card.x as f64,
            card.y as f64,
            card.effective_width() as f64,
            card.height as f64,
        )
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Edges touching counts as intersecting.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x <= other.right()
            && other.x <= self.right()
            && self.y <= other.bottom()
            && other.y <= self.bottom()
    }

    /// Grows the rectangle by `dx`/`dy` on every side.
    pub fn expand(&self, dx: f64, dy: f64) -> Rect {
        Rect::new(
            self.x - dx,
            self.y - dy,
            self.width + 2.0 * dx,
            self.height + 2.0 * dy,
        )
    }

    /// Maps a screen-space viewport to canvas space for the given zoom factor.
    pub fn to_canvas(&self, zoom: f64) -> Rect {
        let zoom = if zoom > 0.0 && zoom.is_finite() { zoom } else { 1.0 };
        Rect::new(
            self.x / zoom,
            self.y / zoom,
            self.width / zoom,
            self.height / zoom,
        )
    }
}

/// SVG path of the curve drawn between two connected cards, from the centre
/// of `start` to the centre of `end` with a single quadratic control point.
pub fn connection_path(start: &Card, end: &Card) -> String {
    let (x1, y1) = Rect::of_card(start).center();
    let (x2, y2) = Rect::of_card(end).center();
    let dx = x2 - x1;
    let dy = y2 - y1;
    let control_x = dx / 2.0;
    let control_y = dy / 2.0 - dx.abs().min(120.0) / 2.0;
    format!(
        "m{},{} q{},{} {},{}",
        x1.round(),
        y1.round(),
        control_x.round(),
        control_y.round(),
        dx.round(),
        dy.round()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CardId;

    #[test]
    fn intersection_and_expansion() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 0.0, 10.0, 10.0);
        assert!(!a.intersects(&b));
        assert!(a.expand(10.0, 0.0).intersects(&b));
    }

    #[test]
    fn viewport_scales_with_zoom() {
        let viewport = Rect::new(100.0, 100.0, 800.0, 600.0);
        let canvas = viewport.to_canvas(2.0);
        assert_eq!(canvas, Rect::new(50.0, 50.0, 400.0, 300.0));
        assert_eq!(viewport.to_canvas(0.0), viewport);
    }

    #[test]
    fn path_starts_at_start_card_centre() {
        let mut start = Card::new(CardId::new(), 0, 0);
        start.width = 100;
        start.height = 40;
        let end = Card::new(CardId::new(), 300, 300);
        let path = connection_path(&start, &end);
        assert!(path.starts_with("m50,20 q"), "{path}");
    }

    #[test]
    fn resized_cards_use_resize_width() {
        let mut card = Card::new(CardId::new(), 0, 0);
        card.resize_width = Some(300);
        assert_eq!(Rect::of_card(&card).width, 300.0);
    }
}
